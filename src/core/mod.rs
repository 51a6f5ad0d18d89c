pub mod config;
pub mod dispatcher;
pub mod engine;
pub mod event_bus;
pub mod extraction;
mod panic_guard;
pub mod request;
pub mod stack;
pub mod stop_signal;

pub use config::EngineConfig;
pub use dispatcher::StepDispatcher;
pub use engine::{
	Activity,
	EngineSnapshot,
	FlowEngine,
	FlowEngineBuilder,
	RunOutcome,
	StepOutcome,
};
pub use event_bus::{
	create_event_channel,
	ChannelListener,
	EngineEvent,
	EventReceiver,
	EventSender,
	ExecutionListener,
	ExecutionPath,
	NoopListener,
	PathSegment,
	ResultSlot,
	Severity,
};
pub use extraction::{apply_extractions, ExtractionReport};
pub use request::{RequestExecutor, RequestOutcome};
pub use stack::{ExecutionStack, FrameKind, LoopPhase, LoopState, ScopeFrame, StepEffect};
pub use stop_signal::StopSignal;
