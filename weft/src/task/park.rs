use crate::context;
use crate::errors::RuntimeError;
use std::cell::RefCell;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};

/// What a parked task wakes up to: a plain wake, or an injected error
/// (terminate, timeout, closed channel) that surfaces at the suspension site.
pub(crate) type Resumption = Result<(), RuntimeError>;

#[derive(Debug)]
enum SlotState {
    Pending,
    Delivered(Resumption),
}

/// One suspension's mailbox. The parked task holds one end through its
/// `Park` future; whoever wakes the task delivers into the other.
#[derive(Debug, Clone)]
pub(crate) struct ParkSlot(Rc<RefCell<SlotState>>);

impl ParkSlot {
    pub(crate) fn new() -> Self {
        ParkSlot(Rc::new(RefCell::new(SlotState::Pending)))
    }

    pub(crate) fn deliver(&self, res: Resumption) {
        let mut state = self.0.borrow_mut();
        // First delivery wins; a wake and a timeout landing on the same tick
        // must not clobber each other.
        if matches!(*state, SlotState::Pending) {
            *state = SlotState::Delivered(res);
        }
    }

    fn take(&self) -> Option<Resumption> {
        let mut state = self.0.borrow_mut();
        match std::mem::replace(&mut *state, SlotState::Pending) {
            SlotState::Delivered(res) => Some(res),
            SlotState::Pending => None,
        }
    }
}

/// Future that suspends the current task until another component resumes it.
///
/// The first poll installs a fresh [`ParkSlot`] on the current task and
/// returns `Pending`; the scheduler transitions the task to `Waiting` when
/// the poll unwinds. The next poll happens only after a resumption was
/// delivered, and yields it.
#[derive(Debug)]
pub struct Park {
    slot: Option<ParkSlot>,
    event: &'static str,
}

/// Suspends the current task until it is explicitly resumed or thrown into.
///
/// This is the primitive every blocking operation in the crate is built on.
/// Calling it outside a runtime task panics.
pub fn park() -> Park {
    park_with_event("park")
}

pub(crate) fn park_with_event(event: &'static str) -> Park {
    Park { slot: None, event }
}

impl Future for Park {
    type Output = Resumption;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match &this.slot {
            None => {
                let task = context::current_task()
                    .expect("park() requires a running weft task; is a runtime active?");
                let slot = ParkSlot::new();
                task.install_park(slot.clone(), this.event);
                this.slot = Some(slot);
                Poll::Pending
            }
            Some(slot) => match slot.take() {
                Some(res) => Poll::Ready(res),
                // Spurious poll before anything was delivered; stay parked.
                None => Poll::Pending,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_first_delivery_wins() {
        let slot = ParkSlot::new();
        slot.deliver(Ok(()));
        slot.deliver(Err(RuntimeError::Terminated));
        assert!(matches!(slot.take(), Some(Ok(()))));
        assert!(slot.take().is_none());
    }
}
