use std::sync::mpsc as std_mpsc;
use std::sync::Arc;
use std::thread;

use mlua::Lua;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

const DEFAULT_MAX_POOL_SIZE: usize = 4;

type Job<T> = (Box<dyn FnOnce(&Lua) -> T + Send>, oneshot::Sender<T>);
type Constructor = Arc<dyn Fn() -> anyhow::Result<Lua> + Send + Sync>;

/// A bounded pool of single-threaded interpreters. Each worker thread owns
/// one interpreter exclusively; submissions are dispatched round-robin and
/// a single merge task drains per-submission returns in submission order,
/// so downstream observes a serialized reduction.
pub struct LuaPool<T: Send + 'static> {
    workers: Vec<std_mpsc::Sender<Job<T>>>,
    returns: mpsc::UnboundedSender<oneshot::Receiver<T>>,
    merge_done: oneshot::Receiver<()>,
    cons: Constructor,
    max_size: usize,
    submissions: usize,
}

impl<T: Send + 'static> LuaPool<T> {
    /// Builds the pool with one eagerly spawned interpreter so constructor
    /// errors (a broken script) surface immediately.
    pub fn new(
        cons: impl Fn() -> anyhow::Result<Lua> + Send + Sync + 'static,
        mut merge: impl FnMut(T) + Send + 'static,
    ) -> anyhow::Result<Self> {
        let (returns_tx, mut returns_rx) = mpsc::unbounded_channel::<oneshot::Receiver<T>>();
        let (done_tx, done_rx) = oneshot::channel();
        tokio::spawn(async move {
            while let Some(ret) = returns_rx.recv().await {
                if let Ok(v) = ret.await {
                    merge(v);
                }
            }
            let _ = done_tx.send(());
        });

        let mut pool = Self {
            workers: Vec::new(),
            returns: returns_tx,
            merge_done: done_rx,
            cons: Arc::new(cons),
            max_size: DEFAULT_MAX_POOL_SIZE,
            submissions: 0,
        };
        pool.spawn_worker()?;
        Ok(pool)
    }

    fn spawn_worker(&mut self) -> anyhow::Result<()> {
        let (tx, rx) = std_mpsc::channel::<Job<T>>();
        let cons = self.cons.clone();
        let (ready_tx, ready_rx) = std_mpsc::channel::<anyhow::Result<()>>();
        thread::spawn(move || {
            let lua = match cons() {
                Ok(lua) => {
                    let _ = ready_tx.send(Ok(()));
                    lua
                }
                Err(err) => {
                    let _ = ready_tx.send(Err(err));
                    return;
                }
            };
            for (f, ret) in rx {
                let _ = ret.send(f(&lua));
            }
        });
        ready_rx
            .recv()
            .unwrap_or_else(|_| Err(anyhow::anyhow!("interpreter thread died")))?;
        self.workers.push(tx);
        tracing::debug!("lua pool size {}", self.workers.len());
        Ok(())
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// Submits one closure. The pool grows lazily, one interpreter per
    /// submission, up to its bound.
    pub fn run(&mut self, f: impl FnOnce(&Lua) -> T + Send + 'static) {
        if self.workers.len() < self.max_size && self.submissions >= self.workers.len() {
            if let Err(err) = self.spawn_worker() {
                tracing::warn!("failed to grow lua pool: {err:#}");
            }
        }

        let (ret_tx, ret_rx) = oneshot::channel();
        // the merge task sees returns in submission order
        let _ = self.returns.send(ret_rx);
        let worker = &self.workers[self.submissions % self.workers.len()];
        let _ = worker.send((Box::new(f), ret_tx));
        self.submissions += 1;
    }

    /// Closes the input side, drains every pending return through the
    /// merge task, and reports cancellation if the context ends first.
    pub async fn wait(self, token: &CancellationToken) -> anyhow::Result<()> {
        drop(self.workers);
        drop(self.returns);
        tokio::select! {
            _ = self.merge_done => Ok(()),
            _ = token.cancelled() => Err(anyhow::anyhow!("cancelled while draining lua pool")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn plain_lua() -> anyhow::Result<Lua> {
        crate::new_lua_state(None, CancellationToken::new())
    }

    #[tokio::test]
    async fn merge_observes_submission_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let mut pool = LuaPool::new(plain_lua, move |v: i64| {
            sink.lock().unwrap().push(v);
        })
        .unwrap();

        for i in 0..32i64 {
            pool.run(move |_lua| i);
        }
        pool.wait(&CancellationToken::new()).await.unwrap();
        let seen = seen.lock().unwrap();
        assert_eq!(*seen, (0..32).collect::<Vec<i64>>());
    }

    #[tokio::test]
    async fn pool_grows_to_its_bound_only() {
        let mut pool = LuaPool::new(plain_lua, |_: ()| {}).unwrap();
        for _ in 0..16 {
            pool.run(|_lua| ());
        }
        assert!(pool.size() <= DEFAULT_MAX_POOL_SIZE);
        assert!(pool.size() > 1);
        pool.wait(&CancellationToken::new()).await.unwrap();
    }

    #[tokio::test]
    async fn scripts_execute_on_workers() {
        let total = Arc::new(Mutex::new(0i64));
        let sink = total.clone();
        let mut pool = LuaPool::new(
            || crate::new_lua_state(Some("function double(n) return n * 2 end"), CancellationToken::new()),
            move |v: i64| *sink.lock().unwrap() += v,
        )
        .unwrap();

        for i in 1..=10i64 {
            pool.run(move |lua| {
                let double: mlua::Function = lua.globals().get("double").unwrap();
                double.call::<_, i64>(i).unwrap()
            });
        }
        pool.wait(&CancellationToken::new()).await.unwrap();
        assert_eq!(*total.lock().unwrap(), 110);
    }

    #[tokio::test]
    async fn broken_constructor_fails_fast() {
        let result = LuaPool::new(
            || crate::new_lua_state(Some("not lua at all"), CancellationToken::new()),
            |_: ()| {},
        );
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn wait_reports_cancellation() {
        let token = CancellationToken::new();
        let mut pool = LuaPool::new(plain_lua, |_: ()| {}).unwrap();
        pool.run(|_lua| std::thread::sleep(std::time::Duration::from_secs(5)));
        token.cancel();
        let err = pool.wait(&token).await;
        assert!(err.is_err());
    }
}
