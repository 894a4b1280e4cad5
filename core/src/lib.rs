//! Call-session execution engine: the per-call interpreter that drives a
//! media-server endpoint through an application, an ordered list of verbs
//! fetched from, and replaceable by, customer webhooks.

mod error;
mod media;
mod session;
mod sip;
pub mod task;
mod telemetry;
mod tts;

pub use error::EndReason;
pub use error::MediaError;
pub use error::SessionError;
pub use error::SignalingError;
pub use error::TaskError;
pub use media::Dtmf;
pub use media::MediaEndpoint;
pub use media::MediaServer;
pub use session::CallSession;
pub use session::SessionServices;
pub use session::SessionState;
pub use sip::CallDirection;
pub use sip::CallLeg;
pub use sip::CallStatus;
pub use sip::CallerInfo;
pub use sip::Dialer;
pub use sip::OutboundCall;
pub use telemetry::NoopSessionTelemetry;
pub use telemetry::SessionTelemetry;
pub use tts::Synthesizer;
