//! Exit statuses. Each failure category maps to its own non-zero code.

use undelete_core::migrate::ErrorKind;

pub mod exit_codes {
    pub const SUCCESS: u8 = 0;
    // 1 is left to setup errors returned from main.
    pub const CONFIG: u8 = 2;
    pub const CONNECTION: u8 = 3;
    pub const SCAN: u8 = 4;
    pub const DECODE: u8 = 5;
    pub const ENCODE: u8 = 6;
    pub const WRITE: u8 = 7;
}

pub fn exit_code(kind: ErrorKind) -> u8 {
    match kind {
        ErrorKind::Config => exit_codes::CONFIG,
        ErrorKind::Connection => exit_codes::CONNECTION,
        ErrorKind::Scan => exit_codes::SCAN,
        ErrorKind::Decode => exit_codes::DECODE,
        ErrorKind::Encode => exit_codes::ENCODE,
        ErrorKind::Write => exit_codes::WRITE,
    }
}
