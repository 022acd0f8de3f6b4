mod helpers;
mod lookup;
mod stats;
mod sync;

pub(crate) use lookup::{cmd_classify, cmd_lookup};
pub(crate) use stats::{cmd_history, cmd_stats};
pub(crate) use sync::cmd_sync;
