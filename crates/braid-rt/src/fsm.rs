//! Task state machine.
//!
//! Every node in the graph moves through a fixed set of scheduling states
//! driven by a fixed set of events. The legal moves live in three const
//! tables indexed by `[state][event]`:
//!
//! - [`TRANSITIONS`]: the next state. Cells not part of the design map to
//!   [`TaskState::Error`]; landing there is a logic fault and panics.
//! - [`EXIT_ACTIONS`]: the policy callback fired when leaving the old
//!   state.
//! - [`ENTRY_ACTIONS`]: the policy callback fired when entering the new
//!   state.
//!
//! A [`StateMachine`] binds the tables to a [`Policy`] -- the set of
//! callbacks invoked as a task crosses state boundaries. The machine owns
//! a mutex held for the duration of a single event, so the exit action,
//! the state write, and the entry action are atomic with respect to
//! concurrent events on the same node.

use log::trace;
use parking_lot::Mutex;

use crate::task::TaskHandle;

// ---------------------------------------------------------------------------
// TaskState
// ---------------------------------------------------------------------------

/// The scheduling state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Submitted but not yet admitted to the ready queue.
    Created,
    /// Eligible to run on a worker.
    Runnable,
    /// Currently being resumed by a worker.
    Running,
    /// Blocked on a channel operation.
    Waiting,
    /// Finished; will never run again.
    Terminated,
    /// Sentinel for illegal transitions.
    Error,
}

pub const NUM_STATES: usize = 6;

impl TaskState {
    pub fn index(self) -> usize {
        match self {
            TaskState::Created => 0,
            TaskState::Runnable => 1,
            TaskState::Running => 2,
            TaskState::Waiting => 3,
            TaskState::Terminated => 4,
            TaskState::Error => 5,
        }
    }

    /// Inverse of [`TaskState::index`], for atomic storage on a node.
    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => TaskState::Created,
            1 => TaskState::Runnable,
            2 => TaskState::Running,
            3 => TaskState::Waiting,
            4 => TaskState::Terminated,
            _ => TaskState::Error,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskState::Created => "created",
            TaskState::Runnable => "runnable",
            TaskState::Running => "running",
            TaskState::Waiting => "waiting",
            TaskState::Terminated => "terminated",
            TaskState::Error => "error",
        }
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// TaskEvent
// ---------------------------------------------------------------------------

/// A signal raised on a task, driving the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskEvent {
    Create,
    Admit,
    Dispatch,
    Wait,
    Notify,
    Exit,
    Yield,
}

pub const NUM_EVENTS: usize = 7;

impl TaskEvent {
    pub fn index(self) -> usize {
        match self {
            TaskEvent::Create => 0,
            TaskEvent::Admit => 1,
            TaskEvent::Dispatch => 2,
            TaskEvent::Wait => 3,
            TaskEvent::Notify => 4,
            TaskEvent::Exit => 5,
            TaskEvent::Yield => 6,
        }
    }

    /// Inverse of [`TaskEvent::index`], for atomic storage on a node.
    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => TaskEvent::Create,
            1 => TaskEvent::Admit,
            2 => TaskEvent::Dispatch,
            3 => TaskEvent::Wait,
            4 => TaskEvent::Notify,
            5 => TaskEvent::Exit,
            6 => TaskEvent::Yield,
            _ => unreachable!("invalid task event encoding: {value}"),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskEvent::Create => "create",
            TaskEvent::Admit => "admit",
            TaskEvent::Dispatch => "dispatch",
            TaskEvent::Wait => "wait",
            TaskEvent::Notify => "notify",
            TaskEvent::Exit => "exit",
            TaskEvent::Yield => "yield",
        }
    }
}

impl std::fmt::Display for TaskEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// TaskAction
// ---------------------------------------------------------------------------

/// A policy callback selector, fired on entering or leaving a state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskAction {
    None,
    Create,
    StopCreate,
    MakeRunnable,
    StopRunnable,
    MakeRunning,
    StopRunning,
    MakeWaiting,
    StopWaiting,
    Terminate,
}

impl TaskAction {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskAction::None => "none",
            TaskAction::Create => "create",
            TaskAction::StopCreate => "stop_create",
            TaskAction::MakeRunnable => "make_runnable",
            TaskAction::StopRunnable => "stop_runnable",
            TaskAction::MakeRunning => "make_running",
            TaskAction::StopRunning => "stop_running",
            TaskAction::MakeWaiting => "make_waiting",
            TaskAction::StopWaiting => "stop_waiting",
            TaskAction::Terminate => "terminate",
        }
    }
}

// ---------------------------------------------------------------------------
// Transition tables
// ---------------------------------------------------------------------------

use self::TaskAction as A;
use self::TaskState as S;

/// Next state, indexed by `[current state][event]`.
#[rustfmt::skip]
pub const TRANSITIONS: [[TaskState; NUM_EVENTS]; NUM_STATES] = [
    //                create       admit        dispatch    wait        notify       exit           yield
    /* created    */ [S::Created,  S::Runnable, S::Error,   S::Error,   S::Error,    S::Error,      S::Error,   ],
    /* runnable   */ [S::Error,    S::Error,    S::Running, S::Error,   S::Error,    S::Error,      S::Error,   ],
    /* running    */ [S::Error,    S::Error,    S::Error,   S::Waiting, S::Running,  S::Terminated, S::Runnable,],
    /* waiting    */ [S::Error,    S::Error,    S::Error,   S::Error,   S::Runnable, S::Error,      S::Waiting, ],
    /* terminated */ [S::Error,    S::Error,    S::Error,   S::Error,   S::Error,    S::Error,      S::Error,   ],
    /* error      */ [S::Error,    S::Error,    S::Error,   S::Error,   S::Error,    S::Error,      S::Error,   ],
];

/// Action fired when leaving a state, indexed by `[current state][event]`.
#[rustfmt::skip]
pub const EXIT_ACTIONS: [[TaskAction; NUM_EVENTS]; NUM_STATES] = [
    //                create    admit          dispatch         wait            notify          exit            yield
    /* created    */ [A::None,  A::StopCreate, A::None,         A::None,        A::None,        A::None,        A::None,       ],
    /* runnable   */ [A::None,  A::None,       A::StopRunnable, A::None,        A::None,        A::None,        A::None,       ],
    /* running    */ [A::None,  A::None,       A::None,         A::StopRunning, A::None,        A::StopRunning, A::StopRunning,],
    /* waiting    */ [A::None,  A::None,       A::None,         A::None,        A::StopWaiting, A::None,        A::None,       ],
    /* terminated */ [A::None,  A::None,       A::None,         A::None,        A::None,        A::None,        A::None,       ],
    /* error      */ [A::None,  A::None,       A::None,         A::None,        A::None,        A::None,        A::None,       ],
];

/// Action fired when entering a state, indexed by `[next state][event]`.
#[rustfmt::skip]
pub const ENTRY_ACTIONS: [[TaskAction; NUM_EVENTS]; NUM_STATES] = [
    //                create     admit            dispatch        wait            notify           exit          yield
    /* created    */ [A::Create, A::None,         A::None,        A::None,        A::None,         A::None,      A::None,        ],
    /* runnable   */ [A::None,   A::MakeRunnable, A::None,        A::None,        A::MakeRunnable, A::None,      A::MakeRunnable,],
    /* running    */ [A::None,   A::None,         A::MakeRunning, A::None,        A::None,         A::None,      A::None,        ],
    /* waiting    */ [A::None,   A::None,         A::None,        A::MakeWaiting, A::None,         A::None,      A::None,        ],
    /* terminated */ [A::None,   A::None,         A::None,        A::None,        A::None,         A::Terminate, A::None,        ],
    /* error      */ [A::None,   A::None,         A::None,        A::None,        A::None,         A::None,      A::None,        ],
];

// ---------------------------------------------------------------------------
// Policy
// ---------------------------------------------------------------------------

/// Callbacks fired as a task crosses state boundaries.
///
/// Every method defaults to a no-op; a policy overrides the hooks it cares
/// about. Callbacks run while the state machine's mutex is held, so they
/// must not re-enter the machine for the same node.
pub trait Policy: Send + Sync {
    fn on_create(&self, _task: &TaskHandle) {}
    fn on_stop_create(&self, _task: &TaskHandle) {}
    fn on_make_runnable(&self, _task: &TaskHandle) {}
    fn on_stop_runnable(&self, _task: &TaskHandle) {}
    fn on_make_running(&self, _task: &TaskHandle) {}
    fn on_stop_running(&self, _task: &TaskHandle) {}
    fn on_make_waiting(&self, _task: &TaskHandle) {}
    fn on_stop_waiting(&self, _task: &TaskHandle) {}
    fn on_terminate(&self, _task: &TaskHandle) {}
}

/// The do-nothing policy.
pub struct NullPolicy;

impl Policy for NullPolicy {}

// ---------------------------------------------------------------------------
// StateMachine
// ---------------------------------------------------------------------------

/// Table-driven state machine over task handles.
pub struct StateMachine<P> {
    policy: P,
    mutex: Mutex<()>,
}

impl<P: Policy> StateMachine<P> {
    pub fn new(policy: P) -> Self {
        StateMachine {
            policy,
            mutex: Mutex::new(()),
        }
    }

    pub fn policy(&self) -> &P {
        &self.policy
    }

    /// Apply `event` to `task`: fire the exit action, write the next
    /// state, fire the entry action. Atomic per event.
    ///
    /// Panics if the transition lands in [`TaskState::Error`] -- an
    /// illegal state/event combination is a logic fault, not a
    /// recoverable condition.
    pub fn event(&self, event: TaskEvent, task: &TaskHandle) {
        let _guard = self.mutex.lock();

        let state = task.state();
        let next = TRANSITIONS[state.index()][event.index()];
        if next == TaskState::Error {
            panic!(
                "logic fault: event `{}` is not legal in state `{}` (node {})",
                event,
                state,
                task.id()
            );
        }
        let exit_action = EXIT_ACTIONS[state.index()][event.index()];
        let entry_action = ENTRY_ACTIONS[next.index()][event.index()];

        trace!(
            "node {} `{}`: {} --{}--> {} (exit {}, entry {})",
            task.id(),
            task.name(),
            state,
            event,
            next,
            exit_action.as_str(),
            entry_action.as_str(),
        );

        self.fire(exit_action, task);
        task.set_state(next);
        self.fire(entry_action, task);
    }

    fn fire(&self, action: TaskAction, task: &TaskHandle) {
        match action {
            TaskAction::None => {}
            TaskAction::Create => self.policy.on_create(task),
            TaskAction::StopCreate => self.policy.on_stop_create(task),
            TaskAction::MakeRunnable => self.policy.on_make_runnable(task),
            TaskAction::StopRunnable => self.policy.on_stop_runnable(task),
            TaskAction::MakeRunning => self.policy.on_make_running(task),
            TaskAction::StopRunning => self.policy.on_stop_running(task),
            TaskAction::MakeWaiting => self.policy.on_make_waiting(task),
            TaskAction::StopWaiting => self.policy.on_stop_waiting(task),
            TaskAction::Terminate => self.policy.on_terminate(task),
        }
    }

    pub fn do_create(&self, task: &TaskHandle) {
        self.event(TaskEvent::Create, task);
    }

    pub fn do_admit(&self, task: &TaskHandle) {
        self.event(TaskEvent::Admit, task);
    }

    pub fn do_dispatch(&self, task: &TaskHandle) {
        self.event(TaskEvent::Dispatch, task);
    }

    pub fn do_wait(&self, task: &TaskHandle) {
        self.event(TaskEvent::Wait, task);
    }

    pub fn do_notify(&self, task: &TaskHandle) {
        self.event(TaskEvent::Notify, task);
    }

    pub fn do_exit(&self, task: &TaskHandle) {
        self.event(TaskEvent::Exit, task);
    }

    pub fn do_yield(&self, task: &TaskHandle) {
        self.event(TaskEvent::Yield, task);
    }
}

impl<P> std::fmt::Debug for StateMachine<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateMachine").finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
