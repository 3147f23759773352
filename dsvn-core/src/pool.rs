//! Session pool
//!
//! Sessions are checked out with [`SessionPool::acquire`] and go back to the
//! idle list when the returned guard is released or dropped. Idle sessions
//! older than the idle timeout are evicted by [`SessionPool::sweep`], which
//! [`SessionPool::spawn_sweeper`] runs periodically on the tokio runtime.

use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::path;
use crate::session::{RepositorySession, SessionFactory};

struct IdleSession {
    session: Box<dyn RepositorySession>,
    since: Instant,
}

struct PoolInner {
    factory: Arc<dyn SessionFactory>,
    idle: Mutex<HashMap<String, Vec<IdleSession>>>,
    idle_timeout: Duration,
}

impl PoolInner {
    fn idle(&self) -> MutexGuard<'_, HashMap<String, Vec<IdleSession>>> {
        match self.idle.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn release(&self, url: String, session: Box<dyn RepositorySession>) {
        self.idle().entry(url).or_default().push(IdleSession {
            session,
            since: Instant::now(),
        });
    }
}

/// Pool of repository sessions keyed by URL. Clones share the pool.
#[derive(Clone)]
pub struct SessionPool {
    inner: Arc<PoolInner>,
}

impl SessionPool {
    pub fn new(factory: Arc<dyn SessionFactory>, idle_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                factory,
                idle: Mutex::new(HashMap::new()),
                idle_timeout,
            }),
        }
    }

    pub fn idle_timeout(&self) -> Duration {
        self.inner.idle_timeout
    }

    /// Reuse an idle session for `url` or open a new one.
    pub fn acquire(&self, url: &str) -> Result<PooledSession> {
        let url = path::canonicalize_url(url)?;
        let reused = self.inner.idle().get_mut(&url).and_then(|list| list.pop());
        let session = match reused {
            Some(idle) => {
                tracing::debug!("reusing pooled session for {}", url);
                idle.session
            }
            None => self.inner.factory.open(&url)?,
        };
        Ok(PooledSession {
            session: Some(session),
            url,
            pool: self.inner.clone(),
        })
    }

    /// Number of idle sessions across all URLs
    pub fn idle_count(&self) -> usize {
        self.inner.idle().values().map(Vec::len).sum()
    }

    /// Drop idle sessions that have waited longer than the idle timeout.
    /// Returns how many were evicted.
    pub fn sweep(&self) -> usize {
        let timeout = self.inner.idle_timeout;
        let mut idle = self.inner.idle();
        let before: usize = idle.values().map(Vec::len).sum();
        for list in idle.values_mut() {
            list.retain(|s| s.since.elapsed() < timeout);
        }
        idle.retain(|_, list| !list.is_empty());
        let evicted = before - idle.values().map(Vec::len).sum::<usize>();
        if evicted > 0 {
            tracing::debug!("evicted {} idle sessions", evicted);
        }
        evicted
    }

    /// Run [`sweep`](Self::sweep) every half idle timeout until `token` is
    /// cancelled.
    pub fn spawn_sweeper(&self, token: CancellationToken) -> JoinHandle<()> {
        let pool = self.clone();
        let period = (self.inner.idle_timeout / 2).max(Duration::from_millis(10));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                tokio::select! {
                    biased;
                    () = token.cancelled() => break,
                    _ = ticker.tick() => {
                        pool.sweep();
                    }
                }
            }
            tracing::debug!("session pool sweeper stopped");
        })
    }
}

/// A session checked out of a [`SessionPool`]
pub struct PooledSession {
    session: Option<Box<dyn RepositorySession>>,
    url: String,
    pool: Arc<PoolInner>,
}

impl PooledSession {
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Hand the session back to the pool.
    pub fn release(mut self) {
        self.give_back();
    }

    fn give_back(&mut self) {
        if let Some(session) = self.session.take() {
            self.pool.release(self.url.clone(), session);
        }
    }
}

impl Deref for PooledSession {
    type Target = dyn RepositorySession;

    fn deref(&self) -> &Self::Target {
        match &self.session {
            Some(session) => session.as_ref(),
            None => unreachable!("pooled session used after release"),
        }
    }
}

impl DerefMut for PooledSession {
    fn deref_mut(&mut self) -> &mut Self::Target {
        match &mut self.session {
            Some(session) => session.as_mut(),
            None => unreachable!("pooled session used after release"),
        }
    }
}

impl Drop for PooledSession {
    fn drop(&mut self) {
        self.give_back();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::Repositories;

    fn pool(timeout: Duration) -> SessionPool {
        let repos = Repositories::new();
        repos.create_memory("pool").unwrap();
        SessionPool::new(Arc::new(repos), timeout)
    }

    #[test]
    fn test_acquire_reuses_released_sessions() {
        let pool = pool(Duration::from_secs(60));
        let session = pool.acquire("mem://pool/").unwrap();
        assert_eq!(session.url(), "mem://pool");
        assert_eq!(session.latest_revision().unwrap(), 0);
        assert_eq!(pool.idle_count(), 0);
        session.release();
        assert_eq!(pool.idle_count(), 1);
        {
            let _again = pool.acquire("mem://pool").unwrap();
            assert_eq!(pool.idle_count(), 0);
        }
        assert_eq!(pool.idle_count(), 1);
        assert_eq!(pool.sweep(), 0);
    }

    #[tokio::test]
    async fn test_sweeper_evicts_idle_sessions() {
        let pool = pool(Duration::from_millis(20));
        drop(pool.acquire("mem://pool").unwrap());
        assert_eq!(pool.idle_count(), 1);

        let token = CancellationToken::new();
        let handle = pool.spawn_sweeper(token.clone());
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(pool.idle_count(), 0);

        token.cancel();
        handle.await.unwrap();
    }
}
