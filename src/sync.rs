use crate::error::MumbleError;
use std::time::Duration;
use tokio::sync::{RwLockReadGuard, RwLockWriteGuard};
use tokio::time::timeout;

const LOCK_TIMEOUT: Duration = Duration::from_secs(1);

/// RwLock whose guard acquisition is bounded in time. A task that cannot take
/// a lock within the timeout gets `MumbleError::Timeout` instead of wedging
/// the whole server behind a stuck peer.
#[derive(Default)]
pub struct RwLock<T>(tokio::sync::RwLock<T>);

impl<T> RwLock<T> {
    pub fn new(value: T) -> Self {
        Self(tokio::sync::RwLock::new(value))
    }

    pub async fn read_err(&self) -> Result<RwLockReadGuard<'_, T>, MumbleError> {
        match timeout(LOCK_TIMEOUT, self.0.read()).await {
            Ok(guard) => Ok(guard),
            Err(_) => Err(MumbleError::Timeout),
        }
    }

    pub async fn write_err(&self) -> Result<RwLockWriteGuard<'_, T>, MumbleError> {
        match timeout(LOCK_TIMEOUT, self.0.write()).await {
            Ok(guard) => Ok(guard),
            Err(_) => Err(MumbleError::Timeout),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn read_after_write_released() {
        let lock = RwLock::new(1);

        {
            let mut guard = lock.write_err().await.unwrap();
            *guard = 2;
        }

        assert_eq!(*lock.read_err().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn write_times_out_when_held() {
        let lock = RwLock::new(());
        let _guard = lock.read_err().await.unwrap();

        assert!(matches!(lock.write_err().await, Err(MumbleError::Timeout)));
    }
}
