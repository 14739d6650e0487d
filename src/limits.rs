//! Hard caps that keep one misbehaving client from exhausting the process.

pub const MAX_SCHEDULES: usize = 200_000;
pub const MAX_SLOTS_PER_SCHEDULE: usize = 96;
pub const MAX_BOOKINGS_PER_SLOT: u32 = 100;

/// Opaque identities come from the session layer; anything longer is garbage.
pub const MAX_IDENTITY_LEN: usize = 128;

/// Live locks a single holder may own at once.
pub const MAX_LOCKS_PER_HOLDER: usize = 4;

pub const MAX_NOTES_LEN: usize = 2_000;

// Wire limits
pub const MAX_FRAME_LEN: usize = 256 * 1024;
pub const MAX_CHANNELS_PER_CONNECTION: usize = 32;

pub const MIN_SWEEP_INTERVAL_MS: u64 = 1;
pub const MAX_SWEEP_INTERVAL_MS: u64 = 1_000;
