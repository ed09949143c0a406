pub mod budget;
pub mod error;
pub mod executor;
pub mod indexer;
pub mod intent;
pub mod parser;
pub mod prompt;
pub mod resolver;
pub mod scene;
pub mod session;

pub use budget::{BudgetConfig, ContextBudgetManager, PrunedContext};
pub use error::EngineError;
pub use executor::{ActionExecutor, ActionOutcome, ExecutorConfig, ImageSearch};
pub use indexer::SceneIndexer;
pub use intent::{HeuristicIntents, IntentStrategy, ResponseIntents};
pub use parser::IncrementalParser;
pub use scene::{InMemoryScene, SceneHost, SceneNode};
pub use session::{
    MemorySink, SessionConfig, SessionHandle, SessionRegistry, SessionRequest, SessionRunner,
};
