use std::sync::Mutex;
use std::time::Duration;

use super::error::{SupervisorError, SupervisorResult};

/// Hands out dev server ports from a strictly increasing counter.
/// Ports are never recycled, even after their session ends.
pub struct PortAllocator {
    // u32 so the counter can step past u16::MAX without wrapping
    next: Mutex<u32>,
    max: u16,
}

impl PortAllocator {
    pub fn new(base: u16, max: u16) -> Self {
        Self {
            next: Mutex::new(base as u32),
            max,
        }
    }

    /// Return the current counter value and advance it.
    pub fn next(&self) -> SupervisorResult<u16> {
        let mut next = self
            .next
            .lock()
            .map_err(|_| anyhow::anyhow!("port allocator lock poisoned"))?;
        if *next > self.max as u32 {
            return Err(SupervisorError::PortsExhausted(self.max));
        }
        let port = *next as u16;
        *next += 1;
        Ok(port)
    }

    /// Peek at the port the next call would return.
    pub fn peek(&self) -> Option<u16> {
        let next = self.next.lock().ok()?;
        (*next <= self.max as u32).then_some(*next as u16)
    }
}

/// Whether something on this host already accepts connections on `port`.
pub async fn is_port_in_use(port: u16) -> bool {
    let addr = std::net::SocketAddr::from(([127, 0, 0, 1], port));
    matches!(
        tokio::time::timeout(Duration::from_millis(200), tokio::net::TcpStream::connect(addr)).await,
        Ok(Ok(_))
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strictly_increasing() {
        let alloc = PortAllocator::new(5173, u16::MAX);
        let a = alloc.next().unwrap();
        let b = alloc.next().unwrap();
        let c = alloc.next().unwrap();
        assert_eq!(a, 5173);
        assert!(a < b && b < c);
        assert_eq!(alloc.peek(), Some(5176));
    }

    #[test]
    fn test_exhaustion() {
        let alloc = PortAllocator::new(9000, 9001);
        assert_eq!(alloc.next().unwrap(), 9000);
        assert_eq!(alloc.next().unwrap(), 9001);
        assert!(matches!(alloc.next(), Err(SupervisorError::PortsExhausted(9001))));
        assert_eq!(alloc.peek(), None);
    }

    #[test]
    fn test_top_of_range_does_not_wrap() {
        let alloc = PortAllocator::new(u16::MAX, u16::MAX);
        assert_eq!(alloc.next().unwrap(), u16::MAX);
        assert!(alloc.next().is_err());
    }

    #[tokio::test]
    async fn test_port_in_use_detects_listener() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(is_port_in_use(port).await);
        drop(listener);
    }
}
