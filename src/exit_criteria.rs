use crate::link_layer::LinkState;

/// Per-state record of the conditions that let the state machine leave its
///  current state. `close` and `io_resource_error` apply to every state; the
///  tagged part carries exactly the flags its state needs, so a state can
///  only ever read its own fields.
///
/// A record is fulfilled as soon as any terminal combination holds; which
///  edge is taken is decided by the state action, in a fixed resolution
///  order, after the wait returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ExitCriteria {
    pub close: bool,
    pub io_resource_error: bool,
    pub per_state: StateCriteria,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StateCriteria {
    Start {
        is_opened: bool,
    },
    Reset {
        reset_sent: bool,
        reset_wait: bool,
    },
    Uninitialized {
        sync_sent: bool,
        sync_rsp_received: bool,
    },
    Initialized {
        sync_config_sent: bool,
        sync_config_rsp_received: bool,
    },
    Active {
        sync_received: bool,
        irrecoverable_sync_error: bool,
    },
    /// FAILED and CLOSED have no exit
    Terminal,
}

impl ExitCriteria {
    /// A fresh, all-clear record for the given state. Entering a state resets
    ///  its record.
    pub fn for_state(state: LinkState) -> ExitCriteria {
        let per_state = match state {
            LinkState::Start => StateCriteria::Start { is_opened: false },
            LinkState::Reset => StateCriteria::Reset {
                reset_sent: false,
                reset_wait: false,
            },
            LinkState::Uninitialized => StateCriteria::Uninitialized {
                sync_sent: false,
                sync_rsp_received: false,
            },
            LinkState::Initialized => StateCriteria::Initialized {
                sync_config_sent: false,
                sync_config_rsp_received: false,
            },
            LinkState::Active => StateCriteria::Active {
                sync_received: false,
                irrecoverable_sync_error: false,
            },
            LinkState::Failed | LinkState::Closed => StateCriteria::Terminal,
        };

        ExitCriteria {
            close: false,
            io_resource_error: false,
            per_state,
        }
    }

    pub fn is_fulfilled(&self) -> bool {
        if self.close || self.io_resource_error {
            return true;
        }

        match self.per_state {
            StateCriteria::Start { is_opened } => is_opened,
            StateCriteria::Reset {
                reset_sent,
                reset_wait,
            } => reset_sent && reset_wait,
            StateCriteria::Uninitialized {
                sync_sent,
                sync_rsp_received,
            } => sync_sent && sync_rsp_received,
            StateCriteria::Initialized {
                sync_config_sent,
                sync_config_rsp_received,
            } => sync_config_sent && sync_config_rsp_received,
            StateCriteria::Active {
                sync_received,
                irrecoverable_sync_error,
            } => sync_received || irrecoverable_sync_error,
            StateCriteria::Terminal => false,
        }
    }

    // The mutators below apply only while the record belongs to the matching
    //  state; a notification racing a state transition falls through and is
    //  ignored, which is safe because the sender re-checks after waking up.

    pub fn mark_opened(&mut self) {
        if let StateCriteria::Start { is_opened } = &mut self.per_state {
            *is_opened = true;
        }
    }

    pub fn mark_reset_sent(&mut self) {
        if let StateCriteria::Reset { reset_sent, .. } = &mut self.per_state {
            *reset_sent = true;
        }
    }

    pub fn mark_reset_wait(&mut self) {
        if let StateCriteria::Reset { reset_wait, .. } = &mut self.per_state {
            *reset_wait = true;
        }
    }

    pub fn mark_sync_sent(&mut self) {
        if let StateCriteria::Uninitialized { sync_sent, .. } = &mut self.per_state {
            *sync_sent = true;
        }
    }

    pub fn mark_sync_rsp_received(&mut self) {
        if let StateCriteria::Uninitialized {
            sync_rsp_received, ..
        } = &mut self.per_state
        {
            *sync_rsp_received = true;
        }
    }

    pub fn mark_sync_config_sent(&mut self) {
        if let StateCriteria::Initialized {
            sync_config_sent, ..
        } = &mut self.per_state
        {
            *sync_config_sent = true;
        }
    }

    pub fn mark_sync_config_rsp_received(&mut self) {
        if let StateCriteria::Initialized {
            sync_config_rsp_received,
            ..
        } = &mut self.per_state
        {
            *sync_config_rsp_received = true;
        }
    }

    pub fn mark_sync_received(&mut self) {
        if let StateCriteria::Active { sync_received, .. } = &mut self.per_state {
            *sync_received = true;
        }
    }

    pub fn mark_irrecoverable_sync_error(&mut self) {
        if let StateCriteria::Active {
            irrecoverable_sync_error,
            ..
        } = &mut self.per_state
        {
            *irrecoverable_sync_error = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case::start(LinkState::Start)]
    #[case::reset(LinkState::Reset)]
    #[case::uninitialized(LinkState::Uninitialized)]
    #[case::initialized(LinkState::Initialized)]
    #[case::active(LinkState::Active)]
    fn test_fresh_record_is_unfulfilled(#[case] state: LinkState) {
        assert!(!ExitCriteria::for_state(state).is_fulfilled());
    }

    #[rstest]
    #[case::close(true, false)]
    #[case::io_error(false, true)]
    fn test_shared_flags_fulfill_every_state(#[case] close: bool, #[case] io_error: bool) {
        for state in [
            LinkState::Start,
            LinkState::Reset,
            LinkState::Uninitialized,
            LinkState::Initialized,
            LinkState::Active,
        ] {
            let mut criteria = ExitCriteria::for_state(state);
            criteria.close = close;
            criteria.io_resource_error = io_error;
            assert!(criteria.is_fulfilled(), "state {:?}", state);
        }
    }

    #[rstest]
    fn test_start_fulfilled_by_open() {
        let mut criteria = ExitCriteria::for_state(LinkState::Start);
        criteria.mark_opened();
        assert!(criteria.is_fulfilled());
    }

    #[rstest]
    #[case::sent_only(true, false, false)]
    #[case::waited_only(false, true, false)]
    #[case::both(true, true, true)]
    fn test_reset_needs_sent_and_wait(
        #[case] sent: bool,
        #[case] waited: bool,
        #[case] expected: bool,
    ) {
        let mut criteria = ExitCriteria::for_state(LinkState::Reset);
        if sent {
            criteria.mark_reset_sent();
        }
        if waited {
            criteria.mark_reset_wait();
        }
        assert_eq!(criteria.is_fulfilled(), expected);
    }

    #[rstest]
    #[case::sent_only(true, false, false)]
    #[case::received_only(false, true, false)]
    #[case::both(true, true, true)]
    fn test_uninitialized_needs_sent_and_response(
        #[case] sent: bool,
        #[case] received: bool,
        #[case] expected: bool,
    ) {
        let mut criteria = ExitCriteria::for_state(LinkState::Uninitialized);
        if sent {
            criteria.mark_sync_sent();
        }
        if received {
            criteria.mark_sync_rsp_received();
        }
        assert_eq!(criteria.is_fulfilled(), expected);
    }

    #[rstest]
    #[case::sync_received(true, false)]
    #[case::sync_error(false, true)]
    fn test_active_fulfilled_by_either_flag(#[case] sync: bool, #[case] error: bool) {
        let mut criteria = ExitCriteria::for_state(LinkState::Active);
        if sync {
            criteria.mark_sync_received();
        }
        if error {
            criteria.mark_irrecoverable_sync_error();
        }
        assert!(criteria.is_fulfilled());
    }

    #[rstest]
    fn test_terminal_never_fulfilled_without_shared_flags() {
        assert!(!ExitCriteria::for_state(LinkState::Failed).is_fulfilled());
        assert!(!ExitCriteria::for_state(LinkState::Closed).is_fulfilled());
    }

    /// a mutator for a different state's flag leaves the record untouched
    #[rstest]
    fn test_mutators_are_state_checked() {
        let mut criteria = ExitCriteria::for_state(LinkState::Uninitialized);
        criteria.mark_sync_config_rsp_received();
        criteria.mark_sync_received();
        criteria.mark_opened();
        assert_eq!(criteria, ExitCriteria::for_state(LinkState::Uninitialized));
    }
}
