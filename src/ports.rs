use socket2::{Domain, Protocol, Socket, Type};
use std::collections::HashSet;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};

// ---------------------------------------------------------------------------
// Probing
// ---------------------------------------------------------------------------

fn bind_probe(ty: Type, protocol: Protocol, port: u16) -> io::Result<Socket> {
    let socket = Socket::new(Domain::IPV4, ty, Some(protocol))?;
    socket.set_reuse_address(true)?;
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    socket.bind(&addr.into())?;
    Ok(socket)
}

/// True when both a TCP and a UDP socket can bind `port` at the same time.
/// The sockets are dropped before returning.
pub fn is_free(port: u16) -> bool {
    let Ok(_tcp) = bind_probe(Type::STREAM, Protocol::TCP, port) else {
        return false;
    };
    bind_probe(Type::DGRAM, Protocol::UDP, port).is_ok()
}

/// First port in `[min, max)` not in `taken` that passes [`is_free`].
pub fn find_first_available(min: u16, max: u16, taken: &HashSet<u16>) -> Option<u16> {
    (min..max).find(|port| !taken.contains(port) && is_free(*port))
}

/// Validate an explicitly requested port: inside `[min, max)`, not in
/// `taken`, and free. The range check comes first, so an out-of-range port
/// is never probed.
pub fn check_valid(port: u16, min: u16, max: u16, taken: &HashSet<u16>) -> Result<(), PortError> {
    if !(min..max).contains(&port) {
        return Err(PortError::OutOfRange { port, min, max });
    }
    if taken.contains(&port) {
        return Err(PortError::Reserved(port));
    }
    if !is_free(port) {
        return Err(PortError::InUse(port));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Reservations
// ---------------------------------------------------------------------------

#[derive(Debug, PartialEq, thiserror::Error)]
pub enum PortError {
    #[error("port {port} is outside the allowed range {min}..{max}")]
    OutOfRange { port: u16, min: u16, max: u16 },
    #[error("port {0} is already claimed by another request")]
    Reserved(u16),
    #[error("port {0} is in use")]
    InUse(u16),
}

/// Port allocator for one configured range.
///
/// Probing alone races with the child process that eventually binds the
/// port, so every handed-out port is held in a claim table until the
/// returned [`PortReservation`] is dropped.
#[derive(Debug, Clone)]
pub struct PortAllocator {
    min: u16,
    max: u16,
    claimed: Arc<Mutex<HashSet<u16>>>,
}

impl PortAllocator {
    pub fn new(min: u16, max: u16) -> Self {
        Self {
            min,
            max,
            claimed: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn range(&self) -> (u16, u16) {
        (self.min, self.max)
    }

    pub fn in_range(&self, port: u16) -> bool {
        (self.min..self.max).contains(&port)
    }

    fn claimed(&self) -> MutexGuard<'_, HashSet<u16>> {
        self.claimed.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_claimed(&self, port: u16) -> bool {
        self.claimed().contains(&port)
    }

    /// Whether any unclaimed port in the range is currently free.
    pub fn has_capacity(&self) -> bool {
        find_first_available(self.min, self.max, &self.claimed()).is_some()
    }

    /// Claim the first free, unclaimed port in the range.
    pub fn reserve_first_available(&self) -> Option<PortReservation> {
        let mut claimed = self.claimed();
        let port = find_first_available(self.min, self.max, &claimed)?;
        claimed.insert(port);
        Some(self.reservation(port))
    }

    /// Claim a specific port.
    pub fn reserve(&self, port: u16) -> Result<PortReservation, PortError> {
        let mut claimed = self.claimed();
        check_valid(port, self.min, self.max, &claimed)?;
        claimed.insert(port);
        Ok(self.reservation(port))
    }

    fn reservation(&self, port: u16) -> PortReservation {
        PortReservation {
            port,
            claimed: Arc::clone(&self.claimed),
        }
    }
}

/// A claimed port. Dropping it returns the port to the pool.
#[derive(Debug)]
pub struct PortReservation {
    port: u16,
    claimed: Arc<Mutex<HashSet<u16>>>,
}

impl PortReservation {
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl Drop for PortReservation {
    fn drop(&mut self) {
        let mut claimed = self.claimed.lock().unwrap_or_else(|e| e.into_inner());
        claimed.remove(&self.port);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{TcpListener, UdpSocket};

    /// Grab an OS-assigned port and release it, to get a likely-free number.
    fn ephemeral_port() -> u16 {
        let l = TcpListener::bind(("0.0.0.0", 0)).unwrap();
        l.local_addr().unwrap().port()
    }

    #[test]
    fn test_find_first_available_skips_bound_udp_port() {
        let udp = UdpSocket::bind(("0.0.0.0", 0)).unwrap();
        let busy = udp.local_addr().unwrap().port();
        if busy == u16::MAX {
            return;
        }
        let found = find_first_available(busy, busy + 1, &HashSet::new());
        assert_eq!(found, None);
        drop(udp);
    }

    #[test]
    fn test_find_first_available_empty_range() {
        assert_eq!(find_first_available(5000, 5000, &HashSet::new()), None);
    }

    #[test]
    fn test_find_first_available_skips_taken() {
        let port = ephemeral_port();
        if port == u16::MAX {
            return;
        }
        let taken = HashSet::from([port]);
        assert_eq!(find_first_available(port, port + 1, &taken), None);
        assert_eq!(find_first_available(port, port + 1, &HashSet::new()), Some(port));
    }

    #[test]
    fn test_check_valid_range_is_half_open() {
        let port = ephemeral_port();
        let none = HashSet::new();
        assert_eq!(
            check_valid(port, port - 1, port, &none),
            Err(PortError::OutOfRange {
                port,
                min: port - 1,
                max: port
            })
        );
        assert!(matches!(
            check_valid(port, port + 1, port + 2, &none),
            Err(PortError::OutOfRange { .. })
        ));
        assert_eq!(check_valid(port, port, port + 1, &none), Ok(()));
        assert_eq!(
            check_valid(port, port, port + 1, &HashSet::from([port])),
            Err(PortError::Reserved(port))
        );
    }

    #[test]
    fn test_check_valid_rejects_listening_port() {
        let listener = TcpListener::bind(("0.0.0.0", 0)).unwrap();
        let port = listener.local_addr().unwrap().port();
        assert_eq!(
            check_valid(port, port, port + 1, &HashSet::new()),
            Err(PortError::InUse(port))
        );
        let alloc = PortAllocator::new(port, port + 1);
        assert_eq!(alloc.reserve(port).unwrap_err(), PortError::InUse(port));
        assert!(!alloc.is_claimed(port));
    }

    #[test]
    fn test_reservation_blocks_second_claim_until_dropped() {
        let port = ephemeral_port();
        let alloc = PortAllocator::new(port, port + 1);

        let first = alloc.reserve(port).unwrap();
        assert_eq!(first.port(), port);
        assert!(alloc.is_claimed(port));
        assert_eq!(alloc.reserve(port).unwrap_err(), PortError::Reserved(port));
        assert!(alloc.reserve_first_available().is_none());

        drop(first);
        assert!(!alloc.is_claimed(port));
        assert!(alloc.reserve(port).is_ok());
    }

    #[test]
    fn test_reserve_out_of_range() {
        let alloc = PortAllocator::new(20000, 20010);
        assert_eq!(
            alloc.reserve(20010).unwrap_err(),
            PortError::OutOfRange {
                port: 20010,
                min: 20000,
                max: 20010
            }
        );
    }

    #[test]
    fn test_reserve_first_available_hands_out_distinct_ports() {
        let base = ephemeral_port();
        if base > u16::MAX - 4 {
            return;
        }
        let alloc = PortAllocator::new(base, base + 4);
        let a = alloc.reserve_first_available();
        let b = alloc.reserve_first_available();
        if let (Some(a), Some(b)) = (a, b) {
            assert_ne!(a.port(), b.port());
        }
    }
}
