pub mod agent;
pub mod extract;
pub mod llm;
pub mod resolver;
pub mod state;

pub use agent::{
    DriverError, InMemorySessionStore, LocateOutcome, LocateRequest, Locator, PlanRequest, Planner,
    PlannerError, SessionDriver, SessionPhase, SessionStatus, SessionStore, StepResponse,
};
pub use llm::{LlmClient, LlmConfig};
pub use resolver::{CoordinateResolver, Resolution, ResolutionSource};
pub use state::{Coordinates, Plan, Screenshot, SessionState};
