//! Binds execution loops to the resources that run them.
//!
//! A dispatcher runs one [`BackgroundExecution`] per unit and reports, through
//! a [`Countdown`], when all of them have exited. Two flavors exist:
//!
//! - [`BackgroundDispatcher`] runs each loop on a dedicated OS thread, each
//!   hosting its own single-threaded tokio runtime.
//! - [`BackgroundDispatcherAsync`] runs each loop as a task on an existing
//!   runtime, with a semaphore bounding how many callbacks run at once.
//!
//! Loops end when the stop token is cancelled. A loop that panics is logged
//! as fatal and stays down: dispatchers never restart crashed units.

use std::{
    any::Any,
    fmt,
    future::Future,
    panic::{self, AssertUnwindSafe},
    sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError},
    thread,
    time::Duration,
};

use tokio::{
    runtime::Handle,
    sync::{Notify, Semaphore},
};
use tokio_util::sync::CancellationToken;

use crate::execution::{BackgroundExecution, ExecutionContext, ExecutionOptions, Health};

/// A type alias for dispatcher results.
pub type Result<T = ()> = std::result::Result<T, Error>;

/// Dispatcher errors.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The dispatcher was given nothing to run its loops on.
    #[error("A dispatcher needs at least one thread or task to run on")]
    NoUnits,

    /// The maximum concurrency was zero.
    #[error("Maximum concurrency must be at least one")]
    ZeroConcurrency,

    /// Error spawning a thread.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A count of running loops that can be waited on until it reaches zero.
#[derive(Debug)]
pub struct Countdown {
    remaining: Mutex<usize>,
    zero: Condvar,
    notify: Notify,
}

impl Countdown {
    /// Creates a countdown starting at `count`.
    pub fn new(count: usize) -> Self {
        Self {
            remaining: Mutex::new(count),
            zero: Condvar::new(),
            notify: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, usize> {
        self.remaining.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// How many loops are still running.
    pub fn remaining(&self) -> usize {
        *self.lock()
    }

    /// Whether every loop has exited.
    pub fn is_done(&self) -> bool {
        self.remaining() == 0
    }

    /// Records that one loop exited.
    pub fn signal(&self) {
        let mut remaining = self.lock();
        *remaining = remaining.saturating_sub(1);
        if *remaining == 0 {
            self.zero.notify_all();
            self.notify.notify_waiters();
        }
    }

    /// Blocks the current thread until every loop exited or `timeout`
    /// elapsed. Returns whether every loop exited.
    ///
    /// Don't call this from async code; use [`wait_async`](Self::wait_async).
    pub fn wait(&self, timeout: Duration) -> bool {
        let remaining = self.lock();
        let (remaining, _) = self
            .zero
            .wait_timeout_while(remaining, timeout, |remaining| *remaining > 0)
            .unwrap_or_else(PoisonError::into_inner);
        *remaining == 0
    }

    /// Waits until every loop exited or `timeout` elapsed. Returns whether
    /// every loop exited.
    pub async fn wait_async(&self, timeout: Duration) -> bool {
        let notified = self.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        if self.is_done() {
            return true;
        }

        let _ = tokio::time::timeout(timeout, notified).await;
        self.is_done()
    }
}

/// Signals the countdown when dropped, however the loop ended.
struct CountdownGuard(Arc<Countdown>);

impl Drop for CountdownGuard {
    fn drop(&mut self) {
        self.0.signal();
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

/// Bookkeeping shared by both dispatcher flavors.
#[derive(Debug)]
struct Units {
    stop_token: CancellationToken,
    countdown: Arc<Countdown>,
    executions: Vec<Arc<BackgroundExecution>>,
    crashed: Arc<Mutex<Vec<usize>>>,
}

impl Units {
    fn new(count: usize, stop_token: &CancellationToken, options: &ExecutionOptions) -> Self {
        // A child token lets the dispatcher stop its own loops without
        // cancelling the caller's token.
        let stop_token = stop_token.child_token();
        let executions = (0..count)
            .map(|_| Arc::new(BackgroundExecution::new(stop_token.clone(), options.clone())))
            .collect();
        Self {
            stop_token,
            countdown: Arc::new(Countdown::new(count)),
            executions,
            crashed: Arc::default(),
        }
    }

    fn record_crash(crashed: &Mutex<Vec<usize>>, unit: usize, message: &str) {
        tracing::error!(
            fatal = true,
            unit,
            panic = message,
            "Execution loop crashed, the dispatcher won't restart it"
        );
        crashed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(unit);
    }

    fn crashed_units(&self) -> Vec<usize> {
        let mut crashed = self
            .crashed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        crashed.sort_unstable();
        crashed
    }

    fn health(&self) -> Vec<Health> {
        self.executions.iter().map(|execution| execution.health()).collect()
    }

    fn stop(&self) {
        self.stop_token.cancel();
    }
}

impl Drop for Units {
    fn drop(&mut self) {
        self.stop_token.cancel();
        for execution in &self.executions {
            execution.dispose();
        }
    }
}

/// Runs execution loops on dedicated OS threads.
///
/// ```rust
/// use std::{thread, time::Duration};
///
/// use afoot::{dispatcher::BackgroundDispatcher, execution::ExecutionOptions};
/// use tokio_util::sync::CancellationToken;
///
/// let stop = CancellationToken::new();
/// let threads = (0..2).map(|i| thread::Builder::new().name(format!("poller-{i}")));
/// let dispatcher = BackgroundDispatcher::start(
///     threads,
///     ExecutionOptions::default(),
///     &stop,
///     |_unit, _context| async {
///         tokio::time::sleep(Duration::from_millis(10)).await;
///         Ok::<_, std::io::Error>(())
///     },
/// )?;
///
/// stop.cancel();
/// assert!(dispatcher.wait(Duration::from_secs(5)));
/// # Ok::<(), afoot::dispatcher::Error>(())
/// ```
pub struct BackgroundDispatcher {
    units: Units,
    threads: Vec<thread::JoinHandle<()>>,
}

impl BackgroundDispatcher {
    /// Spawns one thread per builder, each running `callback` in its own
    /// execution loop until `stop_token` is cancelled.
    ///
    /// `callback` receives the index of the unit it runs on.
    pub fn start<I, F, Fut, E>(
        threads: I,
        options: ExecutionOptions,
        stop_token: &CancellationToken,
        callback: F,
    ) -> Result<Self>
    where
        I: IntoIterator<Item = thread::Builder>,
        F: Fn(usize, ExecutionContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<(), E>>,
        E: fmt::Display,
    {
        let builders = threads.into_iter().collect::<Vec<_>>();
        if builders.is_empty() {
            return Err(Error::NoUnits);
        }

        let units = Units::new(builders.len(), stop_token, &options);
        let callback = Arc::new(callback);
        let mut handles = Vec::with_capacity(builders.len());

        for (unit, builder) in builders.into_iter().enumerate() {
            let guard = CountdownGuard(units.countdown.clone());
            let execution = units.executions[unit].clone();
            let crashed = units.crashed.clone();
            let callback = callback.clone();

            let spawned = builder.spawn(move || {
                let _guard = guard;
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(err) => {
                        Units::record_crash(&crashed, unit, &err.to_string());
                        return;
                    }
                };

                let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                    runtime.block_on(execution.run(|context| callback(unit, context)))
                }));
                if let Err(payload) = outcome {
                    Units::record_crash(&crashed, unit, panic_message(payload.as_ref()));
                }
            });

            match spawned {
                Ok(handle) => handles.push(handle),
                Err(err) => {
                    // Units dropping here stops the threads already running.
                    return Err(err.into());
                }
            }
        }

        Ok(Self {
            units,
            threads: handles,
        })
    }

    /// Blocks until every loop exited or `timeout` elapsed. Returns whether
    /// every loop exited.
    pub fn wait(&self, timeout: Duration) -> bool {
        self.units.countdown.wait(timeout)
    }

    /// Waits until every loop exited or `timeout` elapsed. Returns whether
    /// every loop exited.
    pub async fn wait_async(&self, timeout: Duration) -> bool {
        self.units.countdown.wait_async(timeout).await
    }

    /// Asks every loop to stop.
    pub fn stop(&self) {
        self.units.stop();
    }

    /// Indexes of units whose loop crashed.
    pub fn crashed_units(&self) -> Vec<usize> {
        self.units.crashed_units()
    }

    /// Health of each unit's loop.
    pub fn health(&self) -> Vec<Health> {
        self.units.health()
    }

    /// Number of threads the dispatcher was started with.
    pub fn len(&self) -> usize {
        self.threads.len()
    }

    /// Always false: a dispatcher can't be started without threads.
    pub fn is_empty(&self) -> bool {
        self.threads.is_empty()
    }
}

impl fmt::Debug for BackgroundDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackgroundDispatcher")
            .field("threads", &self.threads.len())
            .field("remaining", &self.units.countdown.remaining())
            .field("crashed", &self.crashed_units())
            .finish()
    }
}

/// Runs execution loops as tasks on a tokio runtime.
///
/// At most `max_concurrency` callbacks run at the same time, however many
/// loops there are.
pub struct BackgroundDispatcherAsync {
    units: Units,
    max_concurrency: usize,
}

impl BackgroundDispatcherAsync {
    /// Spawns `count` execution loops on `handle`, each running `callback`
    /// until `stop_token` is cancelled.
    ///
    /// `callback` receives the index of the unit it runs on.
    pub fn start<F, Fut, E>(
        handle: &Handle,
        count: usize,
        max_concurrency: usize,
        options: ExecutionOptions,
        stop_token: &CancellationToken,
        callback: F,
    ) -> Result<Self>
    where
        F: Fn(usize, ExecutionContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<(), E>> + Send + 'static,
        E: fmt::Display + Send + 'static,
    {
        if count == 0 {
            return Err(Error::NoUnits);
        }
        if max_concurrency == 0 {
            return Err(Error::ZeroConcurrency);
        }

        let units = Units::new(count, stop_token, &options);
        let callback = Arc::new(callback);
        let semaphore = Arc::new(Semaphore::new(max_concurrency));

        for unit in 0..count {
            let guard = CountdownGuard(units.countdown.clone());
            let execution = units.executions[unit].clone();
            let crashed = units.crashed.clone();
            let callback = callback.clone();
            let semaphore = semaphore.clone();

            let task = handle.spawn(async move {
                execution
                    .run(|context| {
                        let callback = callback.clone();
                        let semaphore = semaphore.clone();
                        async move {
                            let Ok(_permit) = semaphore.acquire_owned().await else {
                                return Ok(());
                            };
                            callback(unit, context).await
                        }
                    })
                    .await
            });

            handle.spawn(async move {
                let _guard = guard;
                if let Err(err) = task.await {
                    if err.is_panic() {
                        let payload = err.into_panic();
                        Units::record_crash(&crashed, unit, panic_message(payload.as_ref()));
                    }
                }
            });
        }

        Ok(Self {
            units,
            max_concurrency,
        })
    }

    /// Waits until every loop exited or `timeout` elapsed. Returns whether
    /// every loop exited.
    pub async fn wait_async(&self, timeout: Duration) -> bool {
        self.units.countdown.wait_async(timeout).await
    }

    /// Blocks until every loop exited or `timeout` elapsed. Returns whether
    /// every loop exited.
    ///
    /// Must not be called from a thread driving the dispatcher's runtime.
    pub fn wait(&self, timeout: Duration) -> bool {
        self.units.countdown.wait(timeout)
    }

    /// Asks every loop to stop.
    pub fn stop(&self) {
        self.units.stop();
    }

    /// Indexes of units whose loop crashed.
    pub fn crashed_units(&self) -> Vec<usize> {
        self.units.crashed_units()
    }

    /// Health of each unit's loop.
    pub fn health(&self) -> Vec<Health> {
        self.units.health()
    }

    /// Notifies every loop that work succeeded elsewhere.
    pub fn notify_succeeded(&self) {
        for execution in &self.units.executions {
            execution.notify_succeeded();
        }
    }

    /// Number of loops the dispatcher was started with.
    pub fn len(&self) -> usize {
        self.units.executions.len()
    }

    /// Always false: a dispatcher can't be started without loops.
    pub fn is_empty(&self) -> bool {
        self.units.executions.is_empty()
    }

    /// Upper bound of concurrently running callbacks.
    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }
}

impl fmt::Debug for BackgroundDispatcherAsync {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackgroundDispatcherAsync")
            .field("units", &self.len())
            .field("max_concurrency", &self.max_concurrency)
            .field("remaining", &self.units.countdown.remaining())
            .field("crashed", &self.crashed_units())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::{
        convert::Infallible,
        sync::atomic::{AtomicUsize, Ordering},
    };

    use super::*;

    fn sleeper(
        _unit: usize,
        _context: ExecutionContext,
    ) -> impl Future<Output = std::result::Result<(), Infallible>> + Send {
        async {
            tokio::time::sleep(Duration::from_millis(5)).await;
            Ok(())
        }
    }

    #[test]
    fn countdown_wait_times_out_until_zero() {
        let countdown = Countdown::new(2);
        countdown.signal();
        assert!(!countdown.wait(Duration::from_millis(10)));
        countdown.signal();
        assert!(countdown.wait(Duration::from_millis(10)));
        countdown.signal();
        assert_eq!(countdown.remaining(), 0);
    }

    #[test]
    fn threads_are_required() {
        let err = BackgroundDispatcher::start(
            Vec::<thread::Builder>::new(),
            ExecutionOptions::default(),
            &CancellationToken::new(),
            sleeper,
        )
        .unwrap_err();
        assert!(matches!(err, Error::NoUnits));
    }

    #[test]
    fn thread_dispatcher_stops_on_cancel() -> Result {
        let stop = CancellationToken::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let dispatcher = BackgroundDispatcher::start(
            (0..3).map(|i| thread::Builder::new().name(format!("unit-{i}"))),
            ExecutionOptions::default(),
            &stop,
            {
                let calls = calls.clone();
                move |unit, context| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    sleeper(unit, context)
                }
            },
        )?;
        assert_eq!(dispatcher.len(), 3);

        thread::sleep(Duration::from_millis(50));
        assert!(!dispatcher.wait(Duration::from_millis(1)));
        assert!(calls.load(Ordering::SeqCst) >= 3);

        stop.cancel();
        assert!(dispatcher.wait(Duration::from_secs(5)));
        assert!(dispatcher.crashed_units().is_empty());
        Ok(())
    }

    #[test]
    fn crashed_thread_leaves_the_others_running() -> Result {
        let stop = CancellationToken::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let dispatcher = BackgroundDispatcher::start(
            (0..3).map(|_| thread::Builder::new()),
            ExecutionOptions::default(),
            &stop,
            {
                let calls = calls.clone();
                move |unit, context| {
                    if unit == 1 {
                        panic!("unit 1 is broken");
                    }
                    calls.fetch_add(1, Ordering::SeqCst);
                    sleeper(unit, context)
                }
            },
        )?;

        thread::sleep(Duration::from_millis(50));
        assert_eq!(dispatcher.crashed_units(), [1]);

        let before = calls.load(Ordering::SeqCst);
        thread::sleep(Duration::from_millis(50));
        assert!(calls.load(Ordering::SeqCst) > before);

        dispatcher.stop();
        assert!(dispatcher.wait(Duration::from_secs(5)));
        assert!(!stop.is_cancelled());
        Ok(())
    }

    #[tokio::test]
    async fn async_dispatcher_validates_arguments() {
        let handle = Handle::current();
        let stop = CancellationToken::new();

        let err = BackgroundDispatcherAsync::start(
            &handle,
            0,
            1,
            ExecutionOptions::default(),
            &stop,
            sleeper,
        )
        .unwrap_err();
        assert!(matches!(err, Error::NoUnits));

        let err = BackgroundDispatcherAsync::start(
            &handle,
            1,
            0,
            ExecutionOptions::default(),
            &stop,
            sleeper,
        )
        .unwrap_err();
        assert!(matches!(err, Error::ZeroConcurrency));
    }

    #[tokio::test]
    async fn async_dispatcher_bounds_concurrency() -> Result {
        let stop = CancellationToken::new();
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let dispatcher = BackgroundDispatcherAsync::start(
            &Handle::current(),
            4,
            2,
            ExecutionOptions::default(),
            &stop,
            {
                let running = running.clone();
                let peak = peak.clone();
                move |_, _| {
                    let running = running.clone();
                    let peak = peak.clone();
                    async move {
                        let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(5)).await;
                        running.fetch_sub(1, Ordering::SeqCst);
                        Ok::<_, Infallible>(())
                    }
                }
            },
        )?;

        tokio::time::sleep(Duration::from_millis(100)).await;
        stop.cancel();
        assert!(dispatcher.wait_async(Duration::from_secs(5)).await);
        assert_eq!(peak.load(Ordering::SeqCst), 2);
        Ok(())
    }

    #[tokio::test]
    async fn async_dispatcher_reports_crashed_units() -> Result {
        let stop = CancellationToken::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let dispatcher = BackgroundDispatcherAsync::start(
            &Handle::current(),
            3,
            3,
            ExecutionOptions::default(),
            &stop,
            {
                let calls = calls.clone();
                move |unit, context| {
                    let calls = calls.clone();
                    async move {
                        if unit == 2 {
                            panic!("unit 2 is broken");
                        }
                        calls.fetch_add(1, Ordering::SeqCst);
                        sleeper(unit, context).await
                    }
                }
            },
        )?;

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(dispatcher.crashed_units(), [2]);
        assert_eq!(dispatcher.health(), [Health::Running; 3]);

        let before = calls.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(calls.load(Ordering::SeqCst) > before);

        stop.cancel();
        assert!(dispatcher.wait_async(Duration::from_secs(5)).await);
        Ok(())
    }
}
