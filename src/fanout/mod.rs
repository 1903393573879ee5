pub mod events;
pub mod publisher;
pub mod sink;

pub use events::{CandleUpdate, FeedEvent, LiveTrade};
pub use publisher::{LivePublisher, PublishTally, RepublishHandle};
pub use sink::{BroadcastSink, EventSink};
