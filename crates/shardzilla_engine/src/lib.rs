// Ядро поиска на стороне шарда: схема, план запроса, сегментный порт,
// коллектор, join-исполнитель, гидратация и wire-кодек.
// Broker и searcher собираются поверх этого crate.

pub mod bm25;
pub mod collect;
pub mod error;
pub mod exec;
pub mod hydrate;
pub mod index;
pub mod model;
pub mod query;
pub mod schema;
pub mod wire;

pub use error::{EngineError, Result};
pub use exec::{EngineLimits, QueryEngine, ShardHits};
pub use model::{Document, Value};
