pub mod actions;
pub mod clock;
pub mod errors;
pub mod events;
pub mod ids;
pub mod messages;
pub mod position;
pub mod provider;
pub mod scene;
pub mod session;
pub mod sink;
pub mod tokens;

pub use actions::{Action, ActionDescriptor, ActionKind, ActionStatus, PayloadError};
pub use clock::{Clock, ManualClock, SystemClock};
pub use errors::GatewayError;
pub use events::{EventData, SessionEvent};
pub use ids::{ActionId, EventId, SessionId};
pub use messages::{ConversationMessage, Role};
pub use position::{PositionPreset, PositionSpec, Rect};
pub use scene::{ObjectKind, SceneObject, SceneSnapshot};
pub use session::{SessionError, SessionState};
pub use sink::{SessionSink, SessionUpdate, SinkError};
