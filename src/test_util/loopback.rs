use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use rustc_hash::FxHashMap;
use crate::udp::datagram_socket::DatagramSocket;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Datagram {
    pub from: SocketAddr,
    pub to: SocketAddr,
    pub data: Vec<u8>,
}

impl Datagram {
    pub fn flag(&self) -> u8 {
        self.data.first().copied().unwrap_or(0)
    }
}

type DropFilter = Box<dyn FnMut(&Datagram) -> bool + Send>;

#[derive(Default)]
struct NetworkInner {
    queues: FxHashMap<SocketAddr, VecDeque<Datagram>>,
    drop_filter: Option<DropFilter>,
    sent: Vec<Datagram>,
}

/// An in-memory datagram network. Delivery is immediate and in order unless a drop filter
///  discards datagrams; datagrams to addresses without a socket are lost, like UDP.
#[derive(Clone, Default)]
pub struct LoopbackNetwork {
    inner: Arc<Mutex<NetworkInner>>,
}

impl LoopbackNetwork {
    pub fn new() -> LoopbackNetwork {
        Default::default()
    }

    pub fn socket(&self, addr: SocketAddr) -> LoopbackSocket {
        self.inner.lock().unwrap()
            .queues.entry(addr).or_default();

        LoopbackSocket {
            addr,
            network: self.clone(),
        }
    }

    /// `filter` returns `true` for datagrams that should be lost
    pub fn set_drop_filter(&self, filter: impl FnMut(&Datagram) -> bool + Send + 'static) {
        self.inner.lock().unwrap().drop_filter = Some(Box::new(filter));
    }

    pub fn clear_drop_filter(&self) {
        self.inner.lock().unwrap().drop_filter = None;
    }

    /// all datagrams sent so far, including dropped ones
    pub fn sent(&self) -> Vec<Datagram> {
        self.inner.lock().unwrap().sent.clone()
    }

    pub fn sent_with_flag(&self, flag: u8) -> Vec<Datagram> {
        self.sent().into_iter()
            .filter(|d| d.flag() == flag)
            .collect()
    }

    pub fn clear_sent(&self) {
        self.inner.lock().unwrap().sent.clear();
    }

    /// deliver a hand-crafted datagram, bypassing the drop filter
    pub fn inject(&self, from: SocketAddr, to: SocketAddr, data: &[u8]) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(queue) = inner.queues.get_mut(&to) {
            queue.push_back(Datagram { from, to, data: data.to_vec() });
        }
    }

    pub fn num_pending(&self, addr: SocketAddr) -> usize {
        self.inner.lock().unwrap()
            .queues.get(&addr)
            .map(|q| q.len())
            .unwrap_or(0)
    }
}

pub struct LoopbackSocket {
    addr: SocketAddr,
    network: LoopbackNetwork,
}

impl DatagramSocket for LoopbackSocket {
    fn send_to(&self, datagram: &[u8], to: SocketAddr) -> io::Result<usize> {
        let mut inner = self.network.inner.lock().unwrap();
        let datagram = Datagram {
            from: self.addr,
            to,
            data: datagram.to_vec(),
        };
        inner.sent.push(datagram.clone());

        let dropped = match inner.drop_filter.as_mut() {
            Some(filter) => filter(&datagram),
            None => false,
        };
        let len = datagram.data.len();
        if !dropped {
            if let Some(queue) = inner.queues.get_mut(&to) {
                queue.push_back(datagram);
            }
        }
        Ok(len)
    }

    fn try_recv_from(&self, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddr)>> {
        let mut inner = self.network.inner.lock().unwrap();
        let Some(datagram) = inner.queues.get_mut(&self.addr).and_then(|q| q.pop_front()) else {
            return Ok(None);
        };

        let len = datagram.data.len().min(buf.len());
        buf[..len].copy_from_slice(&datagram.data[..len]);
        Ok(Some((len, datagram.from)))
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(self.addr)
    }
}

#[cfg(test)]
mod tests {
    use crate::test_util::test_addr;
    use super::*;

    #[test]
    fn test_delivery_and_drop() {
        let network = LoopbackNetwork::new();
        let a = network.socket(test_addr(1));
        let b = network.socket(test_addr(2));

        a.send_to(&[1, 2], test_addr(2)).unwrap();
        network.set_drop_filter(|d| d.data == vec![3]);
        a.send_to(&[3], test_addr(2)).unwrap();
        a.send_to(&[4], test_addr(9)).unwrap();

        let mut buf = [0u8; 10];
        assert_eq!(b.try_recv_from(&mut buf).unwrap(), Some((2, test_addr(1))));
        assert_eq!(&buf[..2], &[1, 2]);
        assert_eq!(b.try_recv_from(&mut buf).unwrap(), None);
        assert_eq!(network.sent().len(), 3);
    }
}
