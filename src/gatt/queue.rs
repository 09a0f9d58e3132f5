use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{trace, warn};

use super::operation::{
    CompletionKey, OperationKind, OperationOutput, OperationRequest, OperationResult, Responder,
};
use super::status::{Status, WriteType};
use crate::error::{LinkError, OperationError};
use crate::link::LinkDriver;

#[derive(Debug)]
struct QueuedOperation {
    id: u64,
    request: OperationRequest,
    timeout: Duration,
    responder: Responder,
}

impl QueuedOperation {
    fn kind(&self) -> OperationKind {
        self.request.kind()
    }

    fn resolve(self, result: OperationResult) {
        if self.responder.send(result).is_err() {
            trace!(id = self.id, "caller dropped its pending operation before completion");
        }
    }
}

#[derive(Debug)]
struct InFlightOperation {
    operation: QueuedOperation,
    /// `None` when the timeout lies beyond what `Instant` can represent.
    deadline: Option<Instant>,
}

/// FIFO of GATT requests with at most one dispatched to the link at any time.
#[derive(Debug, Default)]
pub(crate) struct OperationQueue {
    waiting: VecDeque<QueuedOperation>,
    in_flight: Option<InFlightOperation>,
    next_id: u64,
}

impl OperationQueue {
    /// Appends a request and dispatches it right away when the link is idle.
    pub(crate) fn enqueue(
        &mut self,
        request: OperationRequest,
        timeout: Duration,
        responder: Responder,
        link: &mut dyn LinkDriver,
        now: Instant,
    ) {
        let id = self.next_id;
        self.next_id += 1;
        trace!(id, kind = %request.kind(), waiting = self.waiting.len(), "operation queued");
        self.waiting.push_back(QueuedOperation {
            id,
            request,
            timeout,
            responder,
        });
        self.pump(link, now);
    }

    /// Dispatches waiting requests until one is in flight or the queue is empty.
    fn pump(&mut self, link: &mut dyn LinkDriver, now: Instant) {
        while self.in_flight.is_none() {
            let Some(operation) = self.waiting.pop_front() else {
                return;
            };

            match submit(link, &operation.request) {
                Ok(()) => {
                    trace!(id = operation.id, kind = %operation.kind(), "operation dispatched");
                    let deadline = now.checked_add(operation.timeout);
                    self.in_flight = Some(InFlightOperation {
                        operation,
                        deadline,
                    });
                }
                Err(error) => {
                    warn!(id = operation.id, kind = %operation.kind(), %error, "link rejected operation");
                    let kind = operation.kind();
                    operation.resolve(Err(OperationError::LinkFailure {
                        kind,
                        status: Status::Failure,
                    }));
                }
            }
        }
    }

    /// Fulfils the in-flight request answered by a link completion.
    ///
    /// Returns `false` and drops the completion when nothing in flight matches it.
    pub(crate) fn complete(
        &mut self,
        key: CompletionKey,
        status: Status,
        output: OperationOutput,
        link: &mut dyn LinkDriver,
        now: Instant,
    ) -> bool {
        let matches = self
            .in_flight
            .as_ref()
            .is_some_and(|in_flight| in_flight.operation.request.completion_key() == key);
        if !matches {
            warn!(%key, %status, "completion matches no in-flight operation; dropping it");
            return false;
        }
        let Some(InFlightOperation { operation, .. }) = self.in_flight.take() else {
            return false;
        };

        let kind = operation.kind();
        trace!(id = operation.id, %kind, %status, "operation completed");
        let result = if status.is_success() {
            Ok(output)
        } else {
            Err(OperationError::from_status(kind, status))
        };
        operation.resolve(result);
        self.pump(link, now);
        true
    }

    /// Fails the in-flight request with `Timeout` once its deadline has passed.
    pub(crate) fn expire(&mut self, link: &mut dyn LinkDriver, now: Instant) -> bool {
        let expired = self
            .in_flight
            .as_ref()
            .and_then(|in_flight| in_flight.deadline)
            .is_some_and(|deadline| deadline <= now);
        if !expired {
            return false;
        }
        let Some(InFlightOperation { operation, .. }) = self.in_flight.take() else {
            return false;
        };

        let kind = operation.kind();
        warn!(id = operation.id, %kind, "operation timed out");
        let timeout = operation.timeout;
        operation.resolve(Err(OperationError::Timeout { kind, timeout }));
        self.pump(link, now);
        true
    }

    pub(crate) fn deadline(&self) -> Option<Instant> {
        self.in_flight.as_ref().and_then(|in_flight| in_flight.deadline)
    }

    pub(crate) fn in_flight(&self) -> Option<&OperationRequest> {
        self.in_flight
            .as_ref()
            .map(|in_flight| &in_flight.operation.request)
    }

    pub(crate) fn waiting_len(&self) -> usize {
        self.waiting.len()
    }

    /// Resolves every waiting and in-flight request with `Cancelled`.
    pub(crate) fn cancel_all(&mut self) -> usize {
        let in_flight = self.in_flight.take().map(|in_flight| in_flight.operation);
        let cancelled: Vec<QueuedOperation> =
            in_flight.into_iter().chain(self.waiting.drain(..)).collect();
        let count = cancelled.len();
        for operation in cancelled {
            let kind = operation.kind();
            operation.resolve(Err(OperationError::Cancelled { kind }));
        }
        count
    }

    /// Resolves waiting requests matching `predicate` with `Cancelled`.
    ///
    /// The in-flight request is left alone: the link will still answer it.
    pub(crate) fn cancel_waiting_where(
        &mut self,
        predicate: impl Fn(&OperationRequest) -> bool,
    ) -> usize {
        let (cancelled, kept): (VecDeque<_>, VecDeque<_>) = self
            .waiting
            .drain(..)
            .partition(|operation| predicate(&operation.request));
        self.waiting = kept;
        let count = cancelled.len();
        for operation in cancelled {
            let kind = operation.kind();
            operation.resolve(Err(OperationError::Cancelled { kind }));
        }
        count
    }
}

fn submit(link: &mut dyn LinkDriver, request: &OperationRequest) -> Result<(), LinkError> {
    match request {
        OperationRequest::ReadCharacteristic { handle } | OperationRequest::ReadDescriptor { handle } => {
            link.read_attribute(*handle)
        }
        OperationRequest::WriteCharacteristic {
            handle,
            value,
            write_type,
        } => link.write_attribute(*handle, value, *write_type),
        OperationRequest::WriteDescriptor { handle, value } => {
            link.write_attribute(*handle, value, WriteType::WithResponse)
        }
        OperationRequest::ReadRssi => link.read_rssi(),
        OperationRequest::RequestMtu { mtu } => link.request_mtu(*mtu),
        OperationRequest::RequestPriority { priority } => {
            link.request_connection_priority(*priority)
        }
        OperationRequest::SetNotification { handle, enable } => {
            link.set_notification(*handle, *enable)
        }
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;
    use tokio::sync::oneshot;

    use super::*;
    use crate::gatt::AttributeHandle;
    use crate::gatt::test_support::RecordingLink;
    use crate::link::LinkCommand;

    const TIMEOUT: Duration = Duration::from_secs(30);

    fn read(raw: u16) -> OperationRequest {
        OperationRequest::ReadCharacteristic {
            handle: AttributeHandle::new(raw),
        }
    }

    fn enqueue(
        queue: &mut OperationQueue,
        link: &mut RecordingLink,
        request: OperationRequest,
        now: Instant,
    ) -> oneshot::Receiver<OperationResult> {
        let (responder, receiver) = oneshot::channel();
        queue.enqueue(request, TIMEOUT, responder, link, now);
        receiver
    }

    #[test]
    fn only_the_head_is_dispatched_until_it_completes() {
        let now = Instant::now();
        let mut link = RecordingLink::default();
        let mut queue = OperationQueue::default();

        let mut first = enqueue(&mut queue, &mut link, read(1), now);
        let mut second = enqueue(&mut queue, &mut link, read(2), now);

        assert_eq!(
            vec![LinkCommand::ReadAttribute {
                handle: AttributeHandle::new(1)
            }],
            link.commands
        );
        assert_eq!(1, queue.waiting_len());

        assert!(queue.complete(
            CompletionKey::Read(AttributeHandle::new(1)),
            Status::Success,
            OperationOutput::Value(vec![0xAB]),
            &mut link,
            now,
        ));
        assert_eq!(Ok(Ok(OperationOutput::Value(vec![0xAB]))), first.try_recv());
        assert_matches!(second.try_recv(), Err(oneshot::error::TryRecvError::Empty));
        assert_eq!(Some(&read(2)), queue.in_flight());
        assert_eq!(2, link.commands.len());
    }

    #[test]
    fn completion_for_another_handle_is_dropped() {
        let now = Instant::now();
        let mut link = RecordingLink::default();
        let mut queue = OperationQueue::default();
        let mut pending = enqueue(&mut queue, &mut link, read(1), now);

        assert!(!queue.complete(
            CompletionKey::Read(AttributeHandle::new(9)),
            Status::Success,
            OperationOutput::Value(vec![]),
            &mut link,
            now,
        ));
        assert!(!queue.complete(
            CompletionKey::Write(AttributeHandle::new(1)),
            Status::Success,
            OperationOutput::Written,
            &mut link,
            now,
        ));
        assert_matches!(pending.try_recv(), Err(oneshot::error::TryRecvError::Empty));
        assert_eq!(Some(&read(1)), queue.in_flight());
    }

    #[test]
    fn failure_status_is_delivered_through_the_result() {
        let now = Instant::now();
        let mut link = RecordingLink::default();
        let mut queue = OperationQueue::default();
        let mut pending = enqueue(&mut queue, &mut link, read(1), now);

        queue.complete(
            CompletionKey::Read(AttributeHandle::new(1)),
            Status::ReadNotPermitted,
            OperationOutput::Value(vec![]),
            &mut link,
            now,
        );

        assert_eq!(
            Ok(Err(OperationError::LinkFailure {
                kind: OperationKind::ReadCharacteristic,
                status: Status::ReadNotPermitted,
            })),
            pending.try_recv()
        );
    }

    #[test]
    fn expired_operation_times_out_once_and_unblocks_the_queue() {
        let now = Instant::now();
        let mut link = RecordingLink::default();
        let mut queue = OperationQueue::default();
        let mut stalled = enqueue(&mut queue, &mut link, read(1), now);
        let _next = enqueue(&mut queue, &mut link, read(2), now);

        assert!(!queue.expire(&mut link, now + TIMEOUT - Duration::from_millis(1)));
        assert!(queue.expire(&mut link, now + TIMEOUT));
        assert!(!queue.expire(&mut link, now + TIMEOUT));

        assert_eq!(
            Ok(Err(OperationError::Timeout {
                kind: OperationKind::ReadCharacteristic,
                timeout: TIMEOUT,
            })),
            stalled.try_recv()
        );
        assert_eq!(Some(&read(2)), queue.in_flight());
        assert_eq!(Some(now + TIMEOUT + TIMEOUT), queue.deadline());
    }

    #[test]
    fn unrepresentable_timeout_dispatches_without_a_deadline() {
        let now = Instant::now();
        let mut link = RecordingLink::default();
        let mut queue = OperationQueue::default();
        let (responder, mut pending) = oneshot::channel();
        queue.enqueue(read(1), Duration::MAX, responder, &mut link, now);

        assert_eq!(Some(&read(1)), queue.in_flight());
        assert_eq!(None, queue.deadline());
        assert!(!queue.expire(&mut link, now + Duration::from_secs(86_400)));
        assert_matches!(pending.try_recv(), Err(oneshot::error::TryRecvError::Empty));
    }

    #[test]
    fn rejected_dispatch_fails_that_operation_and_moves_on() {
        let now = Instant::now();
        let mut link = RecordingLink::default();
        let mut queue = OperationQueue::default();
        let _blocker = enqueue(&mut queue, &mut link, read(1), now);
        let mut rejected = enqueue(&mut queue, &mut link, read(2), now);
        let _after = enqueue(&mut queue, &mut link, read(3), now);

        link.reject_handle = Some(AttributeHandle::new(2));
        queue.complete(
            CompletionKey::Read(AttributeHandle::new(1)),
            Status::Success,
            OperationOutput::Value(vec![]),
            &mut link,
            now,
        );

        assert_matches!(
            rejected.try_recv(),
            Ok(Err(OperationError::LinkFailure {
                status: Status::Failure,
                ..
            }))
        );
        assert_eq!(Some(&read(3)), queue.in_flight());
    }

    #[test]
    fn cancel_all_resolves_everything_with_cancelled() {
        let now = Instant::now();
        let mut link = RecordingLink::default();
        let mut queue = OperationQueue::default();
        let mut receivers: Vec<_> = (1..=4)
            .map(|raw| enqueue(&mut queue, &mut link, read(raw), now))
            .collect();

        assert_eq!(4, queue.cancel_all());

        for receiver in &mut receivers {
            assert_matches!(
                receiver.try_recv(),
                Ok(Err(OperationError::Cancelled { .. }))
            );
        }
        assert_eq!(None, queue.in_flight());
        assert_eq!(0, queue.waiting_len());
        assert_eq!(None, queue.deadline());
    }

    #[test]
    fn cancel_waiting_where_keeps_in_flight_and_unmatched_requests() {
        let now = Instant::now();
        let mut link = RecordingLink::default();
        let mut queue = OperationQueue::default();
        let mut in_flight = enqueue(&mut queue, &mut link, read(1), now);
        let mut attribute = enqueue(&mut queue, &mut link, read(2), now);
        let mut rssi = enqueue(&mut queue, &mut link, OperationRequest::ReadRssi, now);

        let cancelled = queue.cancel_waiting_where(|request| !request.kind().is_link_level());

        assert_eq!(1, cancelled);
        assert_matches!(
            attribute.try_recv(),
            Ok(Err(OperationError::Cancelled { .. }))
        );
        assert_matches!(in_flight.try_recv(), Err(oneshot::error::TryRecvError::Empty));
        assert_matches!(rssi.try_recv(), Err(oneshot::error::TryRecvError::Empty));
        assert_eq!(1, queue.waiting_len());
    }
}
