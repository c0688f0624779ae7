//! Keeps a quiz-match audience display in sync with the controller.
//!
//! A [`MatchSession`] loads the match from REST, follows the controller's
//! push channel and publishes a [`ViewModel`] for the renderer.

pub mod channel;
pub mod coordinator;
pub mod error;
pub mod lifecycle;
pub mod reconciler;
pub mod roster;
pub mod session;
pub mod snapshot;
pub mod timer;
pub mod view;

pub use channel::{
    ChannelEvent, ConnectionState, EventChannel, PushConnector, ReconnectPolicy, WsConnector,
};
pub use coordinator::{Outcome, RequestCoordinator};
pub use lifecycle::{AnimationPhase, AnimationTiming, ContestantLifecycleEngine};
pub use reconciler::{ControlSignal, ScreenControlReconciler, SignalOrderingKind, SignalOrigin};
pub use session::{DisplayEvent, MatchSession, SessionConfig};
pub use snapshot::{HttpSnapshotSource, SliceKind, SnapshotLoader, SnapshotSource};
pub use view::ViewModel;
