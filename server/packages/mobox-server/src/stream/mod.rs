//! Agent output pipeline: formatter, accumulator, resumable buffers and the
//! bridge that drives them from a sandbox byte stream.

pub mod accumulator;
pub mod bridge;
pub mod formatter;
pub mod frames;
pub mod hub;
pub mod registry;

pub use accumulator::{Accumulator, AccumulatorSnapshot, AuditEvent, UsageTotals};
pub use bridge::{BridgeReport, StreamBridge, StreamRequest};
pub use formatter::{BlockKind, Formatter};
pub use frames::{OutputFrame, ProviderMetadata, ReasoningVariant};
pub use hub::{StreamHub, StreamPublisher};
pub use registry::{MemoryTtlStore, StoreError, StreamEntry, StreamRegistry, TtlStore};
