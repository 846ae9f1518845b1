//! Fixed GATT identifiers. These are protocol constants, not configuration.

use uuid::Uuid;

/// "super" protocol family.
pub const SUPER_SERVICE: Uuid = Uuid::from_u128(0x19b10000_e8f2_537e_4f6c_d104768a1214);
pub const SUPER_AUDIO: Uuid = Uuid::from_u128(0x19b10001_e8f2_537e_4f6c_d104768a1214);
pub const SUPER_CODEC: Uuid = Uuid::from_u128(0x19b10002_e8f2_537e_4f6c_d104768a1214);
pub const SUPER_MUTE: Uuid = Uuid::from_u128(0x19b10003_e8f2_537e_4f6c_d104768a1214);

/// "compass" protocol family. The service UUID is shared with generic UART
/// bridges, so resolution also requires both auxiliary characteristics.
pub const COMPASS_SERVICE: Uuid = Uuid::from_u128(0x6e400001_b5a3_f393_e0a9_e50e24dcca9e);
pub const COMPASS_AUDIO: Uuid = Uuid::from_u128(0x6e400003_b5a3_f393_e0a9_e50e24dcca9e);
pub const COMPASS_CONTROL: Uuid = Uuid::from_u128(0x6e400002_b5a3_f393_e0a9_e50e24dcca9e);
pub const COMPASS_VOLTAGE: Uuid = Uuid::from_u128(0x6e400004_b5a3_f393_e0a9_e50e24dcca9e);

/// Bluetooth SIG Battery Service / Battery Level.
pub const BATTERY_SERVICE: Uuid = Uuid::from_u128(0x0000180f_0000_1000_8000_00805f9b34fb);
pub const BATTERY_LEVEL: Uuid = Uuid::from_u128(0x00002a19_0000_1000_8000_00805f9b34fb);
