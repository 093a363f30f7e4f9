//! Test support for switchyard: an in-memory store with the same scoring
//! semantics as the Redis backend, a scriptable mock flow engine, a mock
//! contact searcher and fixture builders.

mod engine;
mod fixtures;
mod search;
mod store;

pub use engine::{EngineCall, MockEngine};
pub use fixtures::{
    test_assets, test_channel, test_contact, test_flow, test_keyword_trigger, test_org,
};
pub use search::MockSearcher;
pub use store::MemoryStore;
