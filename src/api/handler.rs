use bytes::Bytes;

/// WorkloadHandler is the embedding application's half of the protocol: a
/// function from request bytes to response bytes, run once per quorum
/// member per replicated workload.
///
/// The engine requires it to be deterministic and side-effect-equivalent
/// across nodes: every member must produce byte-identical output for the
/// same input, because the leader verifies exactly that before answering
/// the client. A handler that violates this surfaces as
/// [`SubmitError::InconsistentResponse`](crate::SubmitError::InconsistentResponse)
/// on the client.
pub trait WorkloadHandler: Send + 'static {
    fn process(&mut self, workload: Bytes) -> Bytes;
}

impl<F> WorkloadHandler for F
where
    F: FnMut(Bytes) -> Bytes + Send + 'static,
{
    fn process(&mut self, workload: Bytes) -> Bytes {
        (self)(workload)
    }
}
