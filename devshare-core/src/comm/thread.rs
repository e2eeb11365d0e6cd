//! In-process communicator: every "process" is a thread holding one endpoint.
//!
//! Endpoints share a mailbox fabric. Messages are queued per
//! `(context, channel, source, dest, tag)`, so ordering between a pair of
//! ranks is FIFO and sends never block. Derived communicators
//! (duplicate/split) get a fresh context id that all members agree on
//! through the fabric, which keeps their traffic isolated from the parent's
//! exactly as a real messaging layer would. The agreement itself runs on a
//! control channel that caller messages can never match. A context leaves
//! the fabric, queued messages included, once every member has dropped its
//! endpoint.

use super::Communicator;
use crate::error::{CoreError, Result};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct MailboxKey {
    context: u64,
    control: bool,
    source: usize,
    dest: usize,
    tag: u32,
}

/// (parent context, derivation sequence, color) of a derived communicator.
type Origin = (u64, u64, u32);

struct Child {
    context: u64,
    /// Members that have not looked the context up yet.
    unjoined: usize,
    /// Members holding a live endpoint.
    live: usize,
}

#[derive(Default)]
struct Fabric {
    mailboxes: Mutex<HashMap<MailboxKey, VecDeque<Vec<u8>>>>,
    arrived: Condvar,
    children: Mutex<HashMap<Origin, Child>>,
    next_context: AtomicU64,
}

impl Fabric {
    fn mailboxes(&self) -> Result<MutexGuard<'_, HashMap<MailboxKey, VecDeque<Vec<u8>>>>> {
        self.mailboxes
            .lock()
            .map_err(|_| CoreError::Comm("mailbox lock poisoned".to_string()))
    }

    fn children(&self) -> Result<MutexGuard<'_, HashMap<Origin, Child>>> {
        self.children
            .lock()
            .map_err(|_| CoreError::Comm("context registry lock poisoned".to_string()))
    }

    /// Context of the group `origin` names; the first of its `members` to
    /// ask allocates it.
    fn join(&self, origin: Origin, members: usize) -> Result<u64> {
        let mut children = self.children()?;
        let child = children.entry(origin).or_insert_with(|| Child {
            context: self.next_context.fetch_add(1, Ordering::Relaxed) + 1,
            unjoined: members,
            live: 0,
        });
        child.unjoined = child.unjoined.saturating_sub(1);
        child.live += 1;
        Ok(child.context)
    }

    fn leave(&self, origin: Origin) {
        let Ok(mut children) = self.children() else {
            return;
        };
        let Some(child) = children.get_mut(&origin) else {
            return;
        };
        child.live = child.live.saturating_sub(1);
        if child.live > 0 || child.unjoined > 0 {
            return;
        }
        let context = child.context;
        children.remove(&origin);
        drop(children);
        if let Ok(mut mailboxes) = self.mailboxes() {
            mailboxes.retain(|key, _| key.context != context);
        }
        log::trace!("ctx {} released", context);
    }
}

/// One endpoint of an in-process world.
pub struct ThreadComm {
    fabric: Arc<Fabric>,
    context: u64,
    /// Registry entry of a derived communicator; `None` for world endpoints.
    origin: Option<Origin>,
    rank: usize,
    size: usize,
    host: Arc<str>,
    /// Number of communicators derived from this one so far.
    derived: AtomicU64,
}

impl fmt::Debug for ThreadComm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadComm")
            .field("context", &self.context)
            .field("rank", &self.rank)
            .field("size", &self.size)
            .field("host", &self.host)
            .finish()
    }
}

impl ThreadComm {
    /// Creates `size` endpoints that all report the same host.
    pub fn world(size: usize) -> Vec<ThreadComm> {
        Self::world_on_hosts(&vec!["localhost"; size])
    }

    /// Creates one endpoint per entry of `hosts`; endpoint `i` has rank `i`
    /// and reports `hosts[i]` as its processor name.
    pub fn world_on_hosts<S: AsRef<str>>(hosts: &[S]) -> Vec<ThreadComm> {
        let fabric = Arc::new(Fabric::default());
        let size = hosts.len();
        log::debug!("Creating in-process world with {} endpoints", size);
        hosts
            .iter()
            .enumerate()
            .map(|(rank, host)| ThreadComm {
                fabric: Arc::clone(&fabric),
                context: 0,
                origin: None,
                rank,
                size,
                host: Arc::from(host.as_ref()),
                derived: AtomicU64::new(0),
            })
            .collect()
    }

    fn derive(&self, origin: Origin, context: u64, rank: usize, size: usize) -> ThreadComm {
        ThreadComm {
            fabric: Arc::clone(&self.fabric),
            context,
            origin: Some(origin),
            rank,
            size,
            host: Arc::clone(&self.host),
            derived: AtomicU64::new(0),
        }
    }

    fn check_peer(&self, peer: usize) -> Result<()> {
        if peer >= self.size {
            return Err(CoreError::InvalidRank {
                rank: peer,
                size: self.size,
            });
        }
        Ok(())
    }

    fn post(&self, control: bool, dest: usize, tag: u32, data: &[u8]) -> Result<()> {
        self.check_peer(dest)?;
        let key = MailboxKey {
            context: self.context,
            control,
            source: self.rank,
            dest,
            tag,
        };
        self.fabric
            .mailboxes()?
            .entry(key)
            .or_default()
            .push_back(data.to_vec());
        self.fabric.arrived.notify_all();
        Ok(())
    }

    fn take(&self, control: bool, source: usize, tag: u32) -> Result<Vec<u8>> {
        self.check_peer(source)?;
        let key = MailboxKey {
            context: self.context,
            control,
            source,
            dest: self.rank,
            tag,
        };
        let mut mailboxes = self.fabric.mailboxes()?;
        loop {
            if let Some(queue) = mailboxes.get_mut(&key) {
                if let Some(message) = queue.pop_front() {
                    if queue.is_empty() {
                        mailboxes.remove(&key);
                    }
                    return Ok(message);
                }
            }
            mailboxes = self
                .fabric
                .arrived
                .wait(mailboxes)
                .map_err(|_| CoreError::Comm("mailbox lock poisoned".to_string()))?;
        }
    }

    /// One split record per member, indexed by rank, over the control channel.
    fn exchange_records(&self, record: [u64; 3]) -> Result<Vec<[u64; 3]>> {
        let bytes: &[u8] = bytemuck::cast_slice(&record);
        for peer in (0..self.size).filter(|&p| p != self.rank) {
            self.post(true, peer, 0, bytes)?;
        }
        (0..self.size)
            .map(|peer| {
                if peer == self.rank {
                    return Ok(record);
                }
                let bytes = self.take(true, peer, 0)?;
                bytemuck::try_pod_read_unaligned(&bytes).map_err(|_| {
                    CoreError::MalformedMessage {
                        source_rank: peer,
                        tag: 0,
                        len: bytes.len(),
                        elem_size: std::mem::size_of::<[u64; 3]>(),
                    }
                })
            })
            .collect()
    }
}

impl Drop for ThreadComm {
    fn drop(&mut self) {
        if let Some(origin) = self.origin {
            self.fabric.leave(origin);
        }
    }
}

impl Communicator for ThreadComm {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    fn duplicate(&self) -> Result<Box<dyn Communicator>> {
        self.split(Some(0), self.rank)?.ok_or_else(|| {
            CoreError::Comm("duplicate produced no communicator".to_string())
        })
    }

    fn split(&self, color: Option<u32>, key: usize) -> Result<Option<Box<dyn Communicator>>> {
        let sequence = self.derived.fetch_add(1, Ordering::Relaxed);
        // (has_color, color, key) per rank; u64 keeps the record Pod.
        let record = [
            color.is_some() as u64,
            color.unwrap_or(0) as u64,
            key as u64,
        ];
        let records = self.exchange_records(record)?;

        let Some(color) = color else {
            return Ok(None);
        };
        let mut members: Vec<(u64, usize)> = records
            .iter()
            .enumerate()
            .filter(|(_, r)| r[0] == 1 && r[1] == color as u64)
            .map(|(rank, r)| (r[2], rank))
            .collect();
        members.sort_unstable();
        let new_rank = members
            .iter()
            .position(|&(_, rank)| rank == self.rank)
            .ok_or_else(|| CoreError::Comm("split lost the calling rank".to_string()))?;

        let origin = (self.context, sequence, color);
        let context = self.fabric.join(origin, members.len())?;
        log::trace!(
            "split ctx {} -> ctx {} (color {}, rank {}/{})",
            self.context,
            context,
            color,
            new_rank,
            members.len()
        );
        Ok(Some(Box::new(self.derive(origin, context, new_rank, members.len()))))
    }

    fn send_bytes(&self, dest: usize, tag: u32, data: &[u8]) -> Result<()> {
        self.post(false, dest, tag, data)
    }

    fn recv_bytes(&self, source: usize, tag: u32) -> Result<Vec<u8>> {
        self.take(false, source, tag)
    }

    fn processor_name(&self) -> Result<String> {
        Ok(self.host.to_string())
    }
}
