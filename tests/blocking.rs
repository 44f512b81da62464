//! Waiting on responses from synchronous code.

use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use hyperpool::client::conn::mock::MockTransport;
use hyperpool::client::{
    Client, CompletionHandler, Error, RequestDescriptor, Response, Status, TimeoutKind,
};

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .unwrap()
}

fn client(runtime: &tokio::runtime::Runtime, transport: MockTransport) -> Client {
    Client::builder()
        .with_transport(transport)
        .with_runtime(runtime.handle().clone())
        .build()
}

fn get() -> RequestDescriptor {
    RequestDescriptor::get(http::Uri::from_static("http://a.test/"))
}

/// Records which thread each callback ran on.
#[derive(Debug, Clone, Default)]
struct ThreadRecorder {
    threads: Arc<Mutex<Vec<ThreadId>>>,
}

impl ThreadRecorder {
    fn wait(&self) -> Vec<ThreadId> {
        let deadline = Instant::now() + Duration::from_secs(1);
        while self.threads.lock().is_empty() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        self.threads.lock().clone()
    }
}

impl CompletionHandler for ThreadRecorder {
    type Output = Response;

    fn on_completed(&mut self, response: Response) -> Result<Self::Output, BoxError> {
        self.threads.lock().push(thread::current().id());
        Ok(response)
    }

    fn on_throwable(&mut self, _error: &Error) {
        self.threads.lock().push(thread::current().id());
    }
}

#[test]
fn get_blocks_until_complete() {
    let runtime = runtime();
    let client = client(&runtime, MockTransport::new());

    let response = client.request(get()).get().unwrap();
    assert_eq!(response.status(), http::StatusCode::OK);
}

#[test]
fn get_timeout_does_not_disturb_request() {
    let runtime = runtime();
    let transport = MockTransport::new().gated();
    let client = client(&runtime, transport.clone());

    let future = client.request(get());
    let error = future.get_timeout(Duration::from_millis(20)).unwrap_err();
    assert!(matches!(error, Error::Timeout(TimeoutKind::Wait)));
    assert_eq!(future.status(), Status::Pending);

    transport.release(1);
    let response = future.get_timeout(Duration::from_secs(1)).unwrap();
    assert_eq!(response.status(), http::StatusCode::OK);
}

#[test]
fn get_observes_cancellation_from_another_thread() {
    let runtime = runtime();
    let transport = MockTransport::new().gated();
    let client = client(&runtime, transport);

    let future = Arc::new(client.request(get()));
    let canceller = {
        let future = future.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            future.cancel()
        })
    };

    let error = future.get_timeout(Duration::from_secs(1)).unwrap_err();
    assert!(error.is_cancelled());
    assert_eq!(canceller.join().unwrap(), Status::Pending);
}

#[test]
fn callbacks_run_off_the_calling_thread() {
    let runtime = runtime();
    let caller = thread::current().id();

    let client = client(&runtime, MockTransport::new());
    let recorder = ThreadRecorder::default();
    client.execute(get(), recorder.clone()).get().unwrap();
    assert!(recorder.wait().iter().all(|id| *id != caller));

    // Admission failures resolve the future immediately, but still notify the
    // handler from the runtime.
    let refusing = Client::builder()
        .with_transport(MockTransport::new())
        .with_max_connections_total(0)
        .with_runtime(runtime.handle().clone())
        .build();
    let recorder = ThreadRecorder::default();
    let future = refusing.execute(get(), recorder.clone());
    assert!(future.get().unwrap_err().is_admission());

    let threads = recorder.wait();
    assert_eq!(threads.len(), 1);
    assert_ne!(threads[0], caller);
}

#[test]
fn runtime_shutdown_resolves_pending_requests() {
    let runtime = runtime();
    let transport = MockTransport::new().gated();
    let client = client(&runtime, transport.clone());

    let future = client.request(get());
    let deadline = Instant::now() + Duration::from_secs(1);
    while transport.requests() == 0 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(1));
    }
    assert_eq!(transport.requests(), 1);

    drop(runtime);

    let error = future.get_timeout(Duration::from_secs(1)).unwrap_err();
    assert!(error.is_cancelled());
    assert_eq!(future.status(), Status::Cancelled);
    assert_eq!(client.open_connections(), 0);

    // Requests submitted after the runtime is gone never run, but still resolve.
    let late = client.request(get());
    let error = late.get_timeout(Duration::from_secs(1)).unwrap_err();
    assert!(error.is_cancelled());
}

#[test]
fn get_timeout_accepts_unbounded_duration() {
    let runtime = runtime();
    let client = client(&runtime, MockTransport::new());

    let response = client.request(get()).get_timeout(Duration::MAX).unwrap();
    assert_eq!(response.status(), http::StatusCode::OK);
}
