use std::{
    future::Future,
    ops::Deref,
    pin::Pin,
    task::{Context, Poll},
};
use tokio::task::JoinHandle;

pub trait LockExt {
    type Value;

    fn with<Scope, Out>(&self, scope: Scope) -> Out
    where
        Scope: FnOnce(&Self::Value) -> Out;

    fn with_mut<Scope, Out>(&self, scope: Scope) -> Out
    where
        Scope: FnOnce(&mut Self::Value) -> Out;
}

impl<V> LockExt for std::sync::Mutex<V> {
    type Value = V;

    fn with<Scope, Out>(&self, scope: Scope) -> Out
    where
        Scope: FnOnce(&Self::Value) -> Out,
    {
        let value = self.lock().expect("lock poisoned");
        scope(&*value)
    }

    fn with_mut<Scope, Out>(&self, scope: Scope) -> Out
    where
        Scope: FnOnce(&mut Self::Value) -> Out,
    {
        let mut value = self.lock().expect("lock poisoned");
        scope(&mut *value)
    }
}

impl<V> LockExt for std::sync::RwLock<V> {
    type Value = V;

    fn with<Scope, Out>(&self, scope: Scope) -> Out
    where
        Scope: FnOnce(&Self::Value) -> Out,
    {
        let value = self.read().expect("lock poisoned");
        scope(&*value)
    }

    fn with_mut<Scope, Out>(&self, scope: Scope) -> Out
    where
        Scope: FnOnce(&mut Self::Value) -> Out,
    {
        let mut value = self.write().expect("lock poisoned");
        scope(&mut *value)
    }
}

/// Aborts task associated with [JoinHandle] on drop
#[derive(Debug)]
pub struct AbortJoinHandle<T> {
    handle: JoinHandle<T>,
}

impl<T> Drop for AbortJoinHandle<T> {
    fn drop(&mut self) {
        self.handle.abort()
    }
}

impl<T> Future for AbortJoinHandle<T> {
    type Output = <JoinHandle<T> as Future>::Output;
    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.handle).poll(cx)
    }
}

impl<T> From<JoinHandle<T>> for AbortJoinHandle<T> {
    fn from(handle: JoinHandle<T>) -> Self {
        Self { handle }
    }
}

impl<T> Deref for AbortJoinHandle<T> {
    type Target = JoinHandle<T>;
    fn deref(&self) -> &Self::Target {
        &self.handle
    }
}

/// Split pattern into whitespace separated tokens, empty tokens are skipped
pub fn tokens(pattern: &str) -> impl Iterator<Item = &'_ str> {
    pattern.split_whitespace()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Mutex, RwLock};

    #[test]
    fn test_lock_ext() {
        let value = Mutex::new(1);
        value.with_mut(|value| *value += 1);
        assert_eq!(value.with(|value| *value), 2);

        let value = RwLock::new(vec![1]);
        value.with_mut(|value| value.push(2));
        assert_eq!(value.with(|value| value.clone()), vec![1, 2]);
    }

    #[test]
    fn test_tokens() {
        let result: Vec<_> = tokens("  foo \tbar  baz ").collect();
        assert_eq!(result, vec!["foo", "bar", "baz"]);
        assert_eq!(tokens("   ").count(), 0);
    }

    #[tokio::test]
    async fn test_abort_join_handle() {
        let (send, recv) = tokio::sync::oneshot::channel::<()>();
        let handle: AbortJoinHandle<()> = tokio::spawn(async move {
            let _send = send;
            futures::future::pending::<()>().await
        })
        .into();
        assert!(!handle.is_finished());
        drop(handle);
        // aborted task drops its captures, closing the channel
        assert!(recv.await.is_err());
    }
}
