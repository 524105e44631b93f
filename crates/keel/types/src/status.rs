//! Container lifecycle status and its transition graph
//!
//! Every container carries a [`Status`]. The only way to move it is
//! [`Status::transition`], which succeeds iff the [`StatusMachine`] has an edge
//! from the current state to the destination. A rejected transition leaves the
//! status untouched and is reported to the caller as `false`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::OnceLock;
use thiserror::Error;

/// Lifecycle state of a managed container
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub enum State {
    Created,
    Transfering,
    Clean,
    Prepare,
    Pending,
    DependsChecking,
    DependsSolved,
    DependsFailed,
    Init,
    InitFailed,
    Start,
    ReadinessChecking,
    Ready,
    ReadinessFailed,
    Running,
    Kill,
    Dead,
    Backoff,
    DaemonFailure,
    PendingDelete,
    /// Label not known to this node (e.g. read from a newer peer's snapshot)
    Unknown,
}

impl State {
    pub const ALL: [State; 21] = [
        State::Created,
        State::Transfering,
        State::Clean,
        State::Prepare,
        State::Pending,
        State::DependsChecking,
        State::DependsSolved,
        State::DependsFailed,
        State::Init,
        State::InitFailed,
        State::Start,
        State::ReadinessChecking,
        State::Ready,
        State::ReadinessFailed,
        State::Running,
        State::Kill,
        State::Dead,
        State::Backoff,
        State::DaemonFailure,
        State::PendingDelete,
        State::Unknown,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            State::Created => "CREATED",
            State::Transfering => "TRANSFERING",
            State::Clean => "CLEAN",
            State::Prepare => "PREPARE",
            State::Pending => "PENDING",
            State::DependsChecking => "DEPENDS_CHECKING",
            State::DependsSolved => "DEPENDS_SOLVED",
            State::DependsFailed => "DEPENDS_FAILED",
            State::Init => "INIT",
            State::InitFailed => "INIT_FAILED",
            State::Start => "START",
            State::ReadinessChecking => "READINESS_CHECKING",
            State::Ready => "READY",
            State::ReadinessFailed => "READINESS_FAILED",
            State::Running => "RUNNING",
            State::Kill => "KILL",
            State::Dead => "DEAD",
            State::Backoff => "BACKOFF",
            State::DaemonFailure => "DAEMON_FAILURE",
            State::PendingDelete => "PENDING_DELETE",
            State::Unknown => "UNKNOWN",
        }
    }

    pub fn from_label(label: &str) -> Self {
        State::ALL
            .iter()
            .copied()
            .find(|state| state.as_str() == label)
            .unwrap_or(State::Unknown)
    }

    pub fn category(&self) -> Category {
        match self {
            State::Running => Category::WhileRun,
            State::Clean | State::Kill | State::Dead | State::PendingDelete => Category::PostRun,
            State::Backoff | State::DaemonFailure | State::InitFailed => Category::End,
            _ => Category::PreRun,
        }
    }

    /// States whose dependents may consider them ready
    pub fn is_ready(&self) -> bool {
        matches!(self, State::Ready | State::Running)
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<State> for String {
    fn from(state: State) -> Self {
        state.as_str().to_string()
    }
}

impl From<String> for State {
    fn from(label: String) -> Self {
        State::from_label(&label)
    }
}

/// Coarse lifecycle phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Category {
    PreRun,
    WhileRun,
    PostRun,
    /// Advanced only by external events; periodic re-triggering stops
    End,
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Category::PreRun => write!(f, "PRERUN"),
            Category::WhileRun => write!(f, "WHILERUN"),
            Category::PostRun => write!(f, "POSTRUN"),
            Category::End => write!(f, "END"),
        }
    }
}

/// Errors found while validating the transition graph
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StatusGraphError {
    #[error("State {0} has no vertex")]
    MissingVertex(State),

    #[error("Edge {from} -> {to} points at an unknown vertex")]
    DanglingEdge { from: State, to: State },

    #[error("Edge {from} -> {to} enters the unknown state")]
    EdgeIntoUnknown { from: State, to: State },

    #[error("State {0} cannot reach PENDING_DELETE")]
    Undeletable(State),
}

/// Directed graph of allowed `(state -> state)` transitions
#[derive(Debug, Clone)]
pub struct StatusMachine {
    edges: BTreeMap<State, BTreeSet<State>>,
}

impl StatusMachine {
    /// Build the vertices and edges of the lifecycle graph.
    pub fn create_graph() -> Self {
        use State::*;

        let table: &[(State, &[State])] = &[
            (Unknown, &[Created]),
            (Transfering, &[Created, PendingDelete]),
            (Created, &[Clean, Prepare, PendingDelete]),
            (Clean, &[Created, PendingDelete, Dead, DaemonFailure]),
            (Prepare, &[DependsChecking, Pending, Created, PendingDelete]),
            (Pending, &[DependsChecking, Prepare, Created, PendingDelete]),
            (DependsChecking, &[DependsSolved, DependsFailed, Created, PendingDelete]),
            (DependsSolved, &[Init, Start, Created, PendingDelete]),
            (DependsFailed, &[Prepare, Created, PendingDelete]),
            (Init, &[Start, InitFailed, Created, PendingDelete]),
            (InitFailed, &[Created, PendingDelete]),
            (Start, &[ReadinessChecking, DaemonFailure, Created, PendingDelete]),
            (
                ReadinessChecking,
                &[Ready, Kill, ReadinessFailed, Dead, Created, PendingDelete],
            ),
            (Ready, &[Running, Created, PendingDelete]),
            (ReadinessFailed, &[Kill, Created, PendingDelete]),
            (Running, &[Kill, Dead, Created, PendingDelete]),
            (Kill, &[Dead, DaemonFailure, Created, PendingDelete]),
            (Dead, &[Backoff, Prepare, DaemonFailure, Created, PendingDelete]),
            (Backoff, &[Created, PendingDelete]),
            (DaemonFailure, &[Created, PendingDelete]),
            (PendingDelete, &[Clean]),
        ];

        let mut edges: BTreeMap<State, BTreeSet<State>> = BTreeMap::new();
        for (from, destinations) in table {
            edges
                .entry(*from)
                .or_default()
                .extend(destinations.iter().copied());
        }

        Self { edges }
    }

    /// Process-wide graph, built on first use.
    pub fn global() -> &'static StatusMachine {
        static GRAPH: OnceLock<StatusMachine> = OnceLock::new();
        GRAPH.get_or_init(StatusMachine::create_graph)
    }

    pub fn can_transition(&self, from: State, to: State) -> bool {
        self.edges
            .get(&from)
            .map(|destinations| destinations.contains(&to))
            .unwrap_or(false)
    }

    pub fn destinations(&self, from: State) -> impl Iterator<Item = State> + '_ {
        self.edges.get(&from).into_iter().flatten().copied()
    }

    /// Check the graph is complete and every state can still be deleted.
    pub fn validate(&self) -> Result<(), StatusGraphError> {
        for state in State::ALL {
            if !self.edges.contains_key(&state) {
                return Err(StatusGraphError::MissingVertex(state));
            }
        }

        for (from, destinations) in &self.edges {
            for to in destinations {
                if *to == State::Unknown {
                    return Err(StatusGraphError::EdgeIntoUnknown {
                        from: *from,
                        to: *to,
                    });
                }
                if !self.edges.contains_key(to) {
                    return Err(StatusGraphError::DanglingEdge {
                        from: *from,
                        to: *to,
                    });
                }
            }
        }

        for state in State::ALL {
            if !self.reaches(state, State::PendingDelete) {
                return Err(StatusGraphError::Undeletable(state));
            }
        }

        Ok(())
    }

    fn reaches(&self, from: State, target: State) -> bool {
        let mut seen = BTreeSet::new();
        let mut stack = vec![from];
        while let Some(state) = stack.pop() {
            if state == target {
                return true;
            }
            if seen.insert(state) {
                stack.extend(self.destinations(state));
            }
        }
        false
    }
}

/// Status of one container
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Status {
    pub state: State,
    pub previous: State,
    pub category: Category,

    /// Set while a reconciliation chain is running, cleared on every transition
    #[serde(default)]
    pub reconciling: bool,

    #[serde(default)]
    pub pending_delete: bool,

    pub last_update: DateTime<Utc>,

    #[serde(default)]
    pub depends_solved_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub ready_at: Option<DateTime<Utc>>,
}

impl Status {
    pub fn new() -> Self {
        Self::starting_at(State::Created)
    }

    /// Status for a container that has to wait for another node to release it
    pub fn transfering() -> Self {
        Self::starting_at(State::Transfering)
    }

    fn starting_at(state: State) -> Self {
        Self {
            state,
            previous: state,
            category: state.category(),
            reconciling: false,
            pending_delete: false,
            last_update: Utc::now(),
            depends_solved_at: None,
            ready_at: None,
        }
    }

    /// Move to `dest` if the graph allows it.
    pub fn transition(&mut self, dest: State) -> bool {
        if !StatusMachine::global().can_transition(self.state, dest) {
            return false;
        }

        self.previous = self.state;
        self.state = dest;
        self.category = dest.category();
        self.reconciling = false;
        self.last_update = Utc::now();
        true
    }

    pub fn category(&self) -> Category {
        self.category
    }

    pub fn is_end(&self) -> bool {
        self.category == Category::End
    }
}

impl Default for Status {
    fn default() -> Self {
        Self::new()
    }
}
