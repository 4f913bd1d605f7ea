// Stepper drive binary command protocol.
//
// Every write is a fixed 5-byte frame: opcode + 32-bit little-endian
// payload, delivered as one bus transaction. Reads are a 2-byte request
// (read opcode + variable id) answered by 4 little-endian bytes in a
// second transaction. This is the bit-exact contract with the drive
// firmware.

/// Write command opcodes.
pub const OP_EXIT_SAFE_START: u8 = 0x83;
pub const OP_ENTER_SAFE_START: u8 = 0x8F;
pub const OP_RESET_COMMAND_TIMEOUT: u8 = 0x85;
pub const OP_ENERGIZE: u8 = 0x85;
pub const OP_DEENERGIZE: u8 = 0x86;
pub const OP_RESET: u8 = 0xB0;
pub const OP_CLEAR_DRIVER_ERROR: u8 = 0x8A;
pub const OP_SET_TARGET_POSITION: u8 = 0xE0;
pub const OP_SET_TARGET_VELOCITY: u8 = 0xE3;
pub const OP_HALT_AND_SET_POSITION: u8 = 0xEC;
pub const OP_HALT_AND_HOLD: u8 = 0x89;
pub const OP_GO_HOME: u8 = 0x97;
pub const OP_SET_MAX_SPEED: u8 = 0xE6;
pub const OP_SET_STARTING_SPEED: u8 = 0xE5;
pub const OP_SET_MAX_ACCELERATION: u8 = 0xEA;
pub const OP_SET_MAX_DECELERATION: u8 = 0xE9;
pub const OP_SET_STEP_MODE: u8 = 0x94;
pub const OP_SET_CURRENT_LIMIT: u8 = 0x91;
pub const OP_SET_DECAY_MODE: u8 = 0x92;
pub const OP_SET_AGC_OPTION: u8 = 0x98;
pub const OP_SET_COMMAND_TIMEOUT: u8 = 0xA3;

/// Read request opcode; the second byte selects the variable.
pub const OP_GET_VARIABLE: u8 = 0xA1;

/// Variable ids.
pub const VAR_MISC_FLAGS: u8 = 0x01;
pub const VAR_OPERATION_STATE: u8 = 0x09;
pub const VAR_TARGET_POSITION: u8 = 0x0A;
pub const VAR_TARGET_VELOCITY: u8 = 0x0E;
pub const VAR_CURRENT_POSITION: u8 = 0x22;
pub const VAR_CURRENT_VELOCITY: u8 = 0x26;

/// Misc-flags bit set while a homing cycle is running.
pub const MISC_FLAG_HOMING: u32 = 1 << 4;

/// Step modes are 0-9, microstep factor 2^mode.
pub const STEP_MODE_MAX: u8 = 9;

/// Full-scale current in mA corresponding to the 7-bit limit value 127.
pub const CURRENT_FULL_SCALE_MA: f64 = 9_095.0;
pub const CURRENT_LIMIT_MAX: u8 = 127;

/// Build a 5-byte write frame.
pub fn write_frame(opcode: u8, value: i32) -> [u8; 5] {
    let v = value.to_le_bytes();
    [opcode, v[0], v[1], v[2], v[3]]
}

/// Build a 2-byte variable read request.
pub fn read_request(variable: u8) -> [u8; 2] {
    [OP_GET_VARIABLE, variable]
}

/// Decode a 4-byte little-endian read response.
pub fn decode_response(bytes: [u8; 4]) -> i32 {
    i32::from_le_bytes(bytes)
}

/// Map a milliamp target to the drive's 7-bit current-limit setting.
pub fn current_limit_from_ma(ma: u32) -> u8 {
    let value = (ma as f64 / CURRENT_FULL_SCALE_MA * CURRENT_LIMIT_MAX as f64).round();
    (value as u32).min(CURRENT_LIMIT_MAX as u32) as u8
}

/// Command-timeout payload carries the setting id in the top byte.
pub fn command_timeout_payload(timeout_ms: u32) -> i32 {
    ((0x09 << 24) | timeout_ms) as i32
}
