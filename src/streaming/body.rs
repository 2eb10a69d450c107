use axum::body::Body;
use std::future::Future;
use tokio::io::DuplexStream;
use tokio_util::io::ReaderStream;

/// Default pipe capacity between a producer task and the response body.
pub const PIPE_CAPACITY: usize = 64 * 1024;

/// Build a response body fed by `produce`, which runs on its own task.
///
/// The producer writes into one end of an in-memory pipe. When the client
/// goes away axum drops the body, the read end closes and the producer's
/// next write fails with `BrokenPipe`.
pub fn pipe_body<F, Fut>(capacity: usize, produce: F) -> Body
where
    F: FnOnce(DuplexStream) -> Fut,
    Fut: Future<Output = ()> + Send + 'static,
{
    let (writer, reader) = tokio::io::duplex(capacity);
    tokio::spawn(produce(writer));
    Body::from_stream(ReaderStream::new(reader))
}
