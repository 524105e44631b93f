//! Property tests: a transition succeeds iff the graph has the edge.

use keel_types::{State, Status, StatusMachine};
use proptest::prelude::*;

fn arb_state() -> impl Strategy<Value = State> {
    prop::sample::select(State::ALL.to_vec())
}

fn status_at(state: State) -> Status {
    Status {
        state,
        previous: state,
        category: state.category(),
        ..Status::new()
    }
}

proptest! {
    #[test]
    fn transition_matches_graph(from in arb_state(), to in arb_state()) {
        let graph = StatusMachine::global();
        let mut status = status_at(from);
        let before = status.clone();

        let moved = status.transition(to);

        prop_assert_eq!(moved, graph.can_transition(from, to));
        if moved {
            prop_assert_eq!(status.state, to);
            prop_assert_eq!(status.previous, from);
            prop_assert_eq!(status.category, to.category());
        } else {
            prop_assert_eq!(status, before);
        }
    }

    #[test]
    fn walks_never_leave_the_graph(steps in prop::collection::vec(arb_state(), 1..40)) {
        let graph = StatusMachine::global();
        let mut status = Status::new();

        for to in steps {
            let from = status.state;
            if status.transition(to) {
                prop_assert!(graph.can_transition(from, to));
            } else {
                prop_assert_eq!(status.state, from);
            }
        }
    }
}

#[test]
fn every_state_has_a_vertex() {
    let graph = StatusMachine::global();
    graph.validate().unwrap();
    for state in State::ALL {
        assert!(
            graph.destinations(state).next().is_some(),
            "{state} has no outgoing edge"
        );
    }
}
