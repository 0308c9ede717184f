use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

// ========================= Screenshot =========================

/// Raw image bytes as captured by the external actor. Never decoded here.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Screenshot(Arc<[u8]>);

impl Screenshot {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(Arc::from(bytes.into()))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<u8>> for Screenshot {
    fn from(bytes: Vec<u8>) -> Self {
        Self::new(bytes)
    }
}

impl From<&[u8]> for Screenshot {
    fn from(bytes: &[u8]) -> Self {
        Self(Arc::from(bytes))
    }
}

impl fmt::Debug for Screenshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Screenshot({} bytes)", self.0.len())
    }
}

// ========================= Coordinates =========================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Coordinates {
    pub x: i32,
    pub y: i32,
}

impl Coordinates {
    /// Center of a 1280x720 reference frame.
    pub const FALLBACK: Coordinates = Coordinates { x: 640, y: 360 };
    /// Returned when there is nothing to locate.
    pub const NONE: Coordinates = Coordinates { x: 0, y: 0 };

    pub const fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }
}

impl From<(i32, i32)> for Coordinates {
    fn from((x, y): (i32, i32)) -> Self {
        Self { x, y }
    }
}

impl fmt::Display for Coordinates {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.x, self.y)
    }
}

// ========================= Audit Log =========================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Actor {
    Planner,
    Locator,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub actor: Actor,
    pub message: String,
}

// ========================= Plan =========================

/// What the planner decided for the screenshot it was shown.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    pub step: String,
    pub description: String,
    pub is_complete: bool,
}

// ========================= Session State =========================

/// One session's record. Every update returns a new value; the receiver is
/// left untouched.
#[derive(Clone, Debug)]
pub struct SessionState {
    pub screenshot: Screenshot,
    pub goal: String,
    pub current_step: Option<String>,
    pub step_description: Option<String>,
    pub step_history: Vec<String>,
    pub coordinates: Option<Coordinates>,
    pub is_complete: bool,
    pub log: Vec<LogEntry>,
}

impl SessionState {
    pub fn new(screenshot: Screenshot, goal: impl Into<String>) -> Self {
        Self {
            screenshot,
            goal: goal.into(),
            current_step: None,
            step_description: None,
            step_history: Vec::new(),
            coordinates: None,
            is_complete: false,
            log: Vec::new(),
        }
    }

    /// The external actor performed the pending step and captured a new
    /// screenshot. Coordinates from the old screenshot are dropped.
    pub fn with_screenshot(&self, screenshot: Screenshot) -> Self {
        let mut next = self.clone();
        next.screenshot = screenshot;
        next.coordinates = None;
        if let Some(step) = &self.current_step {
            next.step_history.push(step.clone());
        }
        next
    }

    pub fn with_plan(&self, plan: &Plan) -> Self {
        let mut next = self.clone();
        next.current_step = Some(plan.step.clone());
        next.step_description = Some(plan.description.clone());
        next.is_complete = plan.is_complete;
        next.log.push(LogEntry {
            actor: Actor::Planner,
            message: format!(
                "Generated task: {} with description: {}",
                plan.step, plan.description
            ),
        });
        next
    }

    pub fn with_coordinates(&self, coordinates: Coordinates) -> Self {
        let mut next = self.clone();
        next.coordinates = Some(coordinates);
        next.log.push(LogEntry {
            actor: Actor::Locator,
            message: format!(
                "Generated coordinates {} for task: {}",
                coordinates,
                self.current_step.as_deref().unwrap_or_default()
            ),
        });
        next
    }
}
