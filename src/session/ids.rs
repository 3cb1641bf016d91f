use std::time::{SystemTime, UNIX_EPOCH};

use rand::Rng;

/// Prefix shared by every room code
pub const ROOM_CODE_PREFIX: &str = "RPG-";

/// Alphabet for room codes. Excludes 0/O and 1/I.
pub const ROOM_CODE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

pub const ROOM_CODE_LENGTH: usize = 4;

/// Attempts made to find an unused code before accepting a possible collision
pub const ROOM_CODE_ATTEMPTS: usize = 20;

const BASE36: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
const PARTICIPANT_SUFFIX_LENGTH: usize = 5;

/// Generate a random room code such as `RPG-K7QX`
pub fn generate_room_code() -> String {
    let mut rng = rand::thread_rng();
    let suffix: String = (0..ROOM_CODE_LENGTH)
        .map(|_| ROOM_CODE_ALPHABET[rng.gen_range(0..ROOM_CODE_ALPHABET.len())] as char)
        .collect();
    format!("{}{}", ROOM_CODE_PREFIX, suffix)
}

/// Generate a room code that `is_taken` rejects, retrying up to
/// [`ROOM_CODE_ATTEMPTS`] times. Uniqueness is best effort: once the
/// attempts run out the last candidate is returned unchecked.
pub fn generate_unique_room_code(is_taken: impl Fn(&str) -> bool) -> String {
    let mut code = generate_room_code();
    for attempt in 1..ROOM_CODE_ATTEMPTS {
        if !is_taken(&code) {
            return code;
        }
        tracing::debug!(room_code = %code, attempt, "Room code collision, retrying");
        code = generate_room_code();
    }
    if is_taken(&code) {
        tracing::warn!(room_code = %code, "Room code attempts exhausted, accepting collision");
    }
    code
}

/// Generate a participant id: base-36 timestamp followed by a random suffix.
/// No collision check is made.
pub fn generate_participant_id() -> String {
    let mut rng = rand::thread_rng();
    let suffix: String = (0..PARTICIPANT_SUFFIX_LENGTH)
        .map(|_| BASE36[rng.gen_range(0..BASE36.len())] as char)
        .collect();
    format!("{}{}", to_base36(unix_millis()), suffix)
}

/// Returns true if `code` has the `RPG-XXXX` shape
pub fn is_valid_room_code(code: &str) -> bool {
    match code.strip_prefix(ROOM_CODE_PREFIX) {
        Some(rest) => {
            rest.len() == ROOM_CODE_LENGTH && rest.bytes().all(|b| ROOM_CODE_ALPHABET.contains(&b))
        }
        None => false,
    }
}

/// Milliseconds since the unix epoch
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn to_base36(mut value: u64) -> String {
    if value == 0 {
        return "0".to_string();
    }
    let mut digits = Vec::new();
    while value > 0 {
        digits.push(BASE36[(value % 36) as usize]);
        value /= 36;
    }
    digits.reverse();
    String::from_utf8_lossy(&digits).into_owned()
}
