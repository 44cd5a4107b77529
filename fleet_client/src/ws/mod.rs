//! Account WebSocket stack: wire frames, the per-socket Instance
//! actor, and the Subscription Router that fans subscriptions out
//! across a pool of Instances.

pub(crate) mod frame;
pub(crate) mod instance;
pub(crate) mod router;
