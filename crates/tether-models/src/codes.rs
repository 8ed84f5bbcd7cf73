// Outward status codes for failures that are not plain HTTP conditions.

/// No live channel for the device.
pub const DEVICE_CONNECTION_FAILURE: u16 = 550;
/// The caller's deadline passed while waiting for the device.
pub const DEVICE_CONNECTION_TIMEOUT: u16 = 551;
/// The registered channel went away while an exchange was being opened or used.
pub const DEVICE_CHANNEL_DEFUNCT: u16 = 552;

pub const SERVICE_LOGS_NOT_AVAILABLE: u16 = 553;
pub const IMAGE_PULL_PROGRESS_NOT_AVAILABLE: u16 = 554;
pub const SERVICE_NOT_RUNNING: u16 = 555;
