//! External message pump: the single choke point between the many
//! background producers and the one consumer that owns application state.

pub mod pump;

pub use pump::{
    MessagePump, PumpConfig, PumpRunError, PumpStats, SenderAlreadyRegistered,
    DEFAULT_CRITICAL_LANE_CAPACITY, DEFAULT_NORMAL_LANE_CAPACITY,
};
