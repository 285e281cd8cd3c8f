//! Participant accounting for events.
//!
//! These functions are pure. Callers are expected to run them inside a tree
//! transaction so the count they read is the count they write back.

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CapacityError {
    #[error("At least one guest is required")]
    NoGuests,

    #[error("This event is full")]
    Full,

    #[error(
        "Cannot register {} guests. Only {} {} remaining.",
        .requested,
        .remaining,
        spot_noun(.remaining)
    )]
    InsufficientSpots { requested: u32, remaining: u32 },
}

fn spot_noun(count: &u32) -> &'static str {
    if *count == 1 {
        "spot"
    } else {
        "spots"
    }
}

/// Spots still open. Zero when the event is at or over capacity.
pub fn remaining(max: u32, current: Option<u32>) -> u32 {
    max.saturating_sub(current.unwrap_or(0))
}

/// Decide whether `guests` more participants fit, returning the new count.
pub fn admit(max: u32, current: Option<u32>, guests: u32) -> Result<u32, CapacityError> {
    if guests == 0 {
        return Err(CapacityError::NoGuests);
    }

    let current = current.unwrap_or(0);
    if current >= max {
        return Err(CapacityError::Full);
    }

    let available = max - current;
    if guests > available {
        return Err(CapacityError::InsufficientSpots {
            requested: guests,
            remaining: available,
        });
    }

    Ok(current + guests)
}

/// Count after a registration of `guests` is withdrawn. Never goes below zero.
pub fn release(current: Option<u32>, guests: u32) -> u32 {
    current.unwrap_or(0).saturating_sub(guests)
}
