//! # Memory channels
//!
//! A single-process, cooperatively-scheduled channel: `Sender<T>`/`Receiver<T>`
//! pairs that hand values between tasks running on the same [`weave_core`]
//! runner. Either side can be cloned for MPMC fan-out/fan-in; the channel
//! closes its peer-facing half once every clone of that half has dropped.
//!
//! Parking works the same way every other suspension point in this runtime
//! does: `send`/`recv` checkpoint, try the non-blocking path, and only park
//! (via [`weave_core::wait_task_rescheduled`]) if that would block. A parked
//! sender's value travels with it in the waiter queue; a parked receiver
//! carries an empty slot that whoever wakes it fills in before rescheduling,
//! since a resume outcome itself carries no payload.
//!
//! ```rust
//! use weave_channel::{open_memory_channel, Capacity};
//! use weave_core::RunConfig;
//!
//! let result = weave_core::run(
//!     || async {
//!         let (tx, rx) = open_memory_channel::<i32>(Capacity::Bounded(1));
//!         tx.send(42).await?;
//!         assert_eq!(rx.recv().await?, 42);
//!         Ok::<_, weave_core::WeaveError>(())
//!     },
//!     RunConfig::new(),
//! );
//! assert!(result.is_ok());
//! ```

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fmt;
use std::rc::Rc;

use weave_core::util::{OrderedMap, OrderedSet};
use weave_core::{
    cancel_shielded_checkpoint, checkpoint_if_cancelled, current_task_handle, reschedule_task,
    wait_task_rescheduled, Abort, Task, TaskId, WeaveError,
};

/// A channel's buffer bound: a finite capacity, or unbounded. `Bounded(0)` is
/// a pure rendezvous channel - `send` never succeeds non-blocking unless a
/// receiver is already parked waiting for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capacity {
    Bounded(usize),
    Unbounded,
}

impl Capacity {
    fn has_room(self, used: usize) -> bool {
        match self {
            Capacity::Bounded(max) => used < max,
            Capacity::Unbounded => true,
        }
    }
}

impl fmt::Display for Capacity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Capacity::Bounded(n) => write!(f, "{n}"),
            Capacity::Unbounded => write!(f, "unbounded"),
        }
    }
}

/// A cheap, read-only snapshot of a channel's current load, for logging or
/// tests. Mirrors the shape of the runner's own [`weave_core::RunStatistics`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelStatistics {
    pub current_buffer_used: usize,
    pub max_buffer_size: Capacity,
    pub open_send_channels: usize,
    pub open_receive_channels: usize,
    pub tasks_waiting_send: usize,
    pub tasks_waiting_receive: usize,
}

/// A parked receiver's hand-off slot: whoever wakes it with a value writes it
/// here first, since the resume outcome itself carries no payload.
type RecvSlot<T> = Rc<RefCell<Option<T>>>;

struct ChannelState<T> {
    capacity: Capacity,
    data: VecDeque<T>,
    open_send_channels: usize,
    open_receive_channels: usize,
    /// Ordered across every `Sender` clone, so FIFO wakeup order doesn't
    /// depend on which clone a task happened to park through.
    send_waiters: OrderedMap<TaskId, (Task, T)>,
    recv_waiters: OrderedMap<TaskId, (Task, RecvSlot<T>)>,
}

/// Creates a bounded or unbounded memory channel, returning the sending and
/// receiving halves. Both halves start with one open clone each.
pub fn open_memory_channel<T>(capacity: Capacity) -> (Sender<T>, Receiver<T>) {
    let state = Rc::new(RefCell::new(ChannelState {
        capacity,
        data: VecDeque::new(),
        open_send_channels: 1,
        open_receive_channels: 1,
        send_waiters: OrderedMap::new(),
        recv_waiters: OrderedMap::new(),
    }));
    let sender = Sender {
        state: state.clone(),
        own_waiters: Rc::new(RefCell::new(OrderedSet::new())),
        closed: Cell::new(false),
    };
    let receiver = Receiver {
        state,
        own_waiters: Rc::new(RefCell::new(OrderedSet::new())),
        closed: Cell::new(false),
    };
    (sender, receiver)
}

enum SendAttempt<T> {
    Delivered,
    Blocked(T),
}

/// The sending half of a memory channel. Clone to fan out across multiple
/// producer tasks; each clone tracks its own parked waiters, so closing one
/// clone only wakes the tasks that parked through it.
pub struct Sender<T> {
    state: Rc<RefCell<ChannelState<T>>>,
    own_waiters: Rc<RefCell<OrderedSet<TaskId>>>,
    closed: Cell<bool>,
}

impl<T> Sender<T> {
    fn try_send_inner(&self, value: T) -> Result<SendAttempt<T>, WeaveError> {
        let mut state = self.state.borrow_mut();
        if self.closed.get() {
            return Err(WeaveError::ClosedResource);
        }
        if state.open_receive_channels == 0 {
            return Err(WeaveError::BrokenResource);
        }
        if let Some((_, (task, slot))) = state.recv_waiters.pop_front() {
            *slot.borrow_mut() = Some(value);
            reschedule_task(&task, Ok(()));
            return Ok(SendAttempt::Delivered);
        }
        if state.capacity.has_room(state.data.len()) {
            state.data.push_back(value);
            return Ok(SendAttempt::Delivered);
        }
        Ok(SendAttempt::Blocked(value))
    }

    /// Non-blocking send. `Err(WeaveError::WouldBlock)` if the buffer is full
    /// and no receiver is waiting; the value is dropped in that case (use
    /// [`Sender::send`] if you need to retry with the same value).
    pub fn try_send(&self, value: T) -> Result<(), WeaveError> {
        match self.try_send_inner(value)? {
            SendAttempt::Delivered => Ok(()),
            SendAttempt::Blocked(_) => Err(WeaveError::WouldBlock),
        }
    }

    /// Sends `value`, parking until a receiver (or buffer slot) is available.
    /// Always a checkpoint: cancellable up to the point the value is handed
    /// off or buffered, after which it completes via a shielded checkpoint.
    pub async fn send(&self, value: T) -> Result<(), WeaveError> {
        checkpoint_if_cancelled().await?;
        let value = match self.try_send_inner(value)? {
            SendAttempt::Delivered => {
                cancel_shielded_checkpoint().await;
                return Ok(());
            }
            SendAttempt::Blocked(v) => v,
        };
        cancel_shielded_checkpoint().await;
        self.park(value).await
    }

    async fn park(&self, value: T) -> Result<(), WeaveError> {
        let task = current_task_handle()?;
        let id = task.id();
        self.state.borrow_mut().send_waiters.insert(id, (task, value));
        self.own_waiters.borrow_mut().insert(id);

        let state = self.state.clone();
        let outcome = wait_task_rescheduled(Box::new(move |_raise_cancel| {
            if state.borrow_mut().send_waiters.remove(&id).is_some() {
                Abort::Succeeded
            } else {
                Abort::Failed
            }
        }))
        .await;

        self.own_waiters.borrow_mut().remove(&id);
        outcome
    }

    /// A point-in-time snapshot of the channel's load.
    pub fn statistics(&self) -> ChannelStatistics {
        let state = self.state.borrow();
        ChannelStatistics {
            current_buffer_used: state.data.len(),
            max_buffer_size: state.capacity,
            open_send_channels: state.open_send_channels,
            open_receive_channels: state.open_receive_channels,
            tasks_waiting_send: state.send_waiters.len(),
            tasks_waiting_receive: state.recv_waiters.len(),
        }
    }

    /// Closes this clone early, without waiting for it to drop. Idempotent.
    /// Wakes only the tasks that parked a `send` through this specific clone,
    /// with `ClosedResource`; if this was the last open sender, every parked
    /// receiver (across every `Receiver` clone) wakes with `EndOfChannel`.
    pub fn close(&self) {
        self.close_inner();
    }

    fn close_inner(&self) {
        if self.closed.replace(true) {
            return;
        }
        let mine: Vec<TaskId> = self.own_waiters.borrow_mut().drain().collect();
        let mut woken = Vec::new();
        let last_sender = {
            let mut state = self.state.borrow_mut();
            state.open_send_channels -= 1;
            for id in mine {
                if let Some((task, _)) = state.send_waiters.remove(&id) {
                    woken.push(task);
                }
            }
            state.open_send_channels == 0
        };
        for task in woken {
            reschedule_task(&task, Err(WeaveError::ClosedResource));
        }
        if last_sender {
            let stranded: Vec<Task> = self
                .state
                .borrow_mut()
                .recv_waiters
                .drain()
                .map(|(_, (task, _))| task)
                .collect();
            for task in stranded {
                reschedule_task(&task, Err(WeaveError::EndOfChannel));
            }
        }
    }
}

impl<T> Clone for Sender<T> {
    fn clone(&self) -> Self {
        self.state.borrow_mut().open_send_channels += 1;
        Sender {
            state: self.state.clone(),
            own_waiters: Rc::new(RefCell::new(OrderedSet::new())),
            closed: Cell::new(false),
        }
    }
}

impl<T> Drop for Sender<T> {
    fn drop(&mut self) {
        self.close_inner();
    }
}

/// The receiving half of a memory channel. Clone to fan in across multiple
/// consumer tasks; each clone tracks its own parked waiters, so closing one
/// clone only wakes the tasks that parked through it.
pub struct Receiver<T> {
    state: Rc<RefCell<ChannelState<T>>>,
    own_waiters: Rc<RefCell<OrderedSet<TaskId>>>,
    closed: Cell<bool>,
}

impl<T> Receiver<T> {
    fn try_recv_inner(&self) -> Result<T, WeaveError> {
        let mut state = self.state.borrow_mut();
        if self.closed.get() {
            return Err(WeaveError::ClosedResource);
        }
        if let Some((_, (task, value))) = state.send_waiters.pop_front() {
            state.data.push_back(value);
            reschedule_task(&task, Ok(()));
        }
        if let Some(value) = state.data.pop_front() {
            return Ok(value);
        }
        if state.open_send_channels == 0 {
            return Err(WeaveError::EndOfChannel);
        }
        Err(WeaveError::WouldBlock)
    }

    /// Non-blocking receive. `Err(WeaveError::WouldBlock)` if the buffer is
    /// empty and no sender is waiting.
    pub fn try_recv(&self) -> Result<T, WeaveError> {
        self.try_recv_inner()
    }

    /// Receives a value, parking until one is available. Always a
    /// checkpoint, the same way [`Sender::send`] is.
    pub async fn recv(&self) -> Result<T, WeaveError> {
        checkpoint_if_cancelled().await?;
        match self.try_recv_inner() {
            Ok(v) => {
                cancel_shielded_checkpoint().await;
                return Ok(v);
            }
            Err(WeaveError::WouldBlock) => {}
            Err(e) => return Err(e),
        }
        cancel_shielded_checkpoint().await;
        self.park().await
    }

    async fn park(&self) -> Result<T, WeaveError> {
        let task = current_task_handle()?;
        let id = task.id();
        let slot: RecvSlot<T> = Rc::new(RefCell::new(None));
        self.state.borrow_mut().recv_waiters.insert(id, (task, slot.clone()));
        self.own_waiters.borrow_mut().insert(id);

        let state = self.state.clone();
        let outcome = wait_task_rescheduled(Box::new(move |_raise_cancel| {
            if state.borrow_mut().recv_waiters.remove(&id).is_some() {
                Abort::Succeeded
            } else {
                Abort::Failed
            }
        }))
        .await;

        self.own_waiters.borrow_mut().remove(&id);
        outcome?;
        Ok(slot
            .borrow_mut()
            .take()
            .expect("receiver rescheduled with Value(()) but no value was deposited"))
    }

    /// A point-in-time snapshot of the channel's load.
    pub fn statistics(&self) -> ChannelStatistics {
        let state = self.state.borrow();
        ChannelStatistics {
            current_buffer_used: state.data.len(),
            max_buffer_size: state.capacity,
            open_send_channels: state.open_send_channels,
            open_receive_channels: state.open_receive_channels,
            tasks_waiting_send: state.send_waiters.len(),
            tasks_waiting_receive: state.recv_waiters.len(),
        }
    }

    /// Closes this clone early, without waiting for it to drop. Idempotent.
    /// Wakes only the tasks that parked a `recv` through this specific
    /// clone, with `ClosedResource`; if this was the last open receiver,
    /// every parked sender (across every `Sender` clone) wakes with
    /// `BrokenResource` and the buffer is dropped.
    pub fn close(&self) {
        self.close_inner();
    }

    fn close_inner(&self) {
        if self.closed.replace(true) {
            return;
        }
        let mine: Vec<TaskId> = self.own_waiters.borrow_mut().drain().collect();
        let mut woken = Vec::new();
        let last_receiver = {
            let mut state = self.state.borrow_mut();
            state.open_receive_channels -= 1;
            for id in mine {
                if let Some((task, _)) = state.recv_waiters.remove(&id) {
                    woken.push(task);
                }
            }
            state.open_receive_channels == 0
        };
        for task in woken {
            reschedule_task(&task, Err(WeaveError::ClosedResource));
        }
        if last_receiver {
            let stranded: Vec<Task> = {
                let mut state = self.state.borrow_mut();
                state.data.clear();
                state.send_waiters.drain().map(|(_, (task, _))| task).collect()
            };
            for task in stranded {
                reschedule_task(&task, Err(WeaveError::BrokenResource));
            }
        }
    }
}

impl<T> Clone for Receiver<T> {
    fn clone(&self) -> Self {
        self.state.borrow_mut().open_receive_channels += 1;
        Receiver {
            state: self.state.clone(),
            own_waiters: Rc::new(RefCell::new(OrderedSet::new())),
            closed: Cell::new(false),
        }
    }
}

impl<T> Drop for Receiver<T> {
    fn drop(&mut self) {
        self.close_inner();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use weave_core::{open_nursery, run, sleep, RunConfig};

    #[test]
    fn try_send_then_try_recv_round_trips_through_the_buffer() {
        let (tx, rx) = open_memory_channel::<i32>(Capacity::Bounded(2));
        assert!(tx.try_send(1).is_ok());
        assert!(tx.try_send(2).is_ok());
        assert!(matches!(tx.try_send(3), Err(WeaveError::WouldBlock)));
        assert_eq!(rx.try_recv().unwrap(), 1);
        assert_eq!(rx.try_recv().unwrap(), 2);
        assert!(matches!(rx.try_recv(), Err(WeaveError::WouldBlock)));
    }

    #[test]
    fn rendezvous_try_send_blocks_without_a_waiting_receiver() {
        let (tx, _rx) = open_memory_channel::<i32>(Capacity::Bounded(0));
        assert!(matches!(tx.try_send(1), Err(WeaveError::WouldBlock)));
    }

    #[test]
    fn try_recv_on_empty_channel_with_no_senders_ends() {
        let (tx, rx) = open_memory_channel::<i32>(Capacity::Bounded(1));
        tx.close();
        assert!(matches!(rx.try_recv(), Err(WeaveError::EndOfChannel)));
    }

    #[test]
    fn try_send_after_every_receiver_drops_is_broken() {
        let (tx, rx) = open_memory_channel::<i32>(Capacity::Unbounded);
        drop(rx);
        assert!(matches!(tx.try_send(1), Err(WeaveError::BrokenResource)));
    }

    #[test]
    fn statistics_reflect_buffer_and_clone_counts() {
        let (tx, rx) = open_memory_channel::<i32>(Capacity::Bounded(4));
        let _tx2 = tx.clone();
        tx.try_send(1).unwrap();
        pretty_assertions::assert_eq!(
            rx.statistics(),
            ChannelStatistics {
                current_buffer_used: 1,
                max_buffer_size: Capacity::Bounded(4),
                open_send_channels: 2,
                open_receive_channels: 1,
                tasks_waiting_send: 0,
                tasks_waiting_receive: 0,
            }
        );
    }

    #[test]
    fn rendezvous_send_completes_once_a_receiver_parks() {
        let result = run(
            || async {
                let (tx, rx) = open_memory_channel::<i32>(Capacity::Bounded(0));
                open_nursery(|nursery| async move {
                    nursery.start_soon(async move { tx.send(7).await.map_err(Into::into) })?;
                    let v = rx.recv().await?;
                    assert_eq!(v, 7);
                    Ok::<_, WeaveError>(())
                })
                .await
            },
            RunConfig::new(),
        );
        assert!(result.is_ok(), "{result:?}");
    }

    #[test]
    fn closing_the_last_sender_ends_a_parked_receiver() {
        let result = run(
            || async {
                let (tx, rx) = open_memory_channel::<i32>(Capacity::Bounded(0));
                open_nursery(|nursery| async move {
                    nursery.start_soon(async move {
                        sleep(0.01).await?;
                        drop(tx);
                        Ok::<_, WeaveError>(())
                    })?;
                    match rx.recv().await {
                        Err(WeaveError::EndOfChannel) => Ok(()),
                        other => panic!("expected EndOfChannel, got {other:?}"),
                    }
                })
                .await
            },
            RunConfig::new(),
        );
        assert!(result.is_ok(), "{result:?}");
    }

    #[test]
    fn a_send_in_an_already_cancelled_scope_never_reaches_the_waiter_queue() {
        let result = run(
            || async {
                let (tx, _rx) = open_memory_channel::<i32>(Capacity::Bounded(0));
                let scope = weave_core::CancelScope::new(0.0, false);
                let observed: Rc<RefCell<Option<Result<(), WeaveError>>>> =
                    Rc::new(RefCell::new(None));
                let observed_inner = observed.clone();
                let tx_inner = tx.clone();
                // The scope's deadline has already passed, so it is
                // cancelled the moment it is entered; `send`'s opening
                // checkpoint observes that immediately and the call never
                // reaches the waiter queue. The scope itself absorbs that
                // `Cancelled`, so we stash the send's own outcome to inspect
                // separately.
                scope
                    .run(move || async move {
                        let outcome = tx_inner.send(1).await;
                        *observed_inner.borrow_mut() = Some(outcome);
                        Ok::<_, WeaveError>(())
                    })
                    .await?;
                let outcome = observed.borrow_mut().take().expect("body ran");
                assert!(matches!(outcome, Err(WeaveError::Cancelled)));
                assert_eq!(tx.statistics().tasks_waiting_send, 0);
                Ok::<_, WeaveError>(())
            },
            RunConfig::new(),
        );
        assert!(result.is_ok(), "{result:?}");
    }

    #[test]
    fn a_cancelled_send_removes_itself_from_the_waiter_queue() {
        let result = run(
            || async {
                let (tx, rx) = open_memory_channel::<i32>(Capacity::Bounded(0));
                let scope = weave_core::CancelScope::new(f64::INFINITY, false);
                let observed: Rc<RefCell<Option<Result<(), WeaveError>>>> =
                    Rc::new(RefCell::new(None));
                let observed_inner = observed.clone();
                let tx_inner = tx.clone();
                let scope_inner = scope.clone();

                open_nursery(|nursery| async move {
                    nursery.start_soon(async move {
                        scope_inner
                            .run(move || async move {
                                let outcome = tx_inner.send(1).await;
                                *observed_inner.borrow_mut() = Some(outcome);
                                Ok::<_, WeaveError>(())
                            })
                            .await?;
                        Ok::<_, WeaveError>(())
                    })?;

                    // Give the sender a chance to actually park on the
                    // rendezvous channel before we cancel out from under it.
                    sleep(0.01).await?;
                    assert_eq!(tx.statistics().tasks_waiting_send, 1);
                    scope.cancel();
                    Ok::<_, WeaveError>(())
                })
                .await?;

                let outcome = observed.borrow_mut().take().expect("body ran");
                assert!(matches!(outcome, Err(WeaveError::Cancelled)));
                assert_eq!(tx.statistics().tasks_waiting_send, 0);
                drop(rx);
                Ok::<_, WeaveError>(())
            },
            RunConfig::new(),
        );
        assert!(result.is_ok(), "{result:?}");
    }
}
