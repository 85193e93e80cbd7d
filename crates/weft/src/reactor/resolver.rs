use std::{
    net::{IpAddr, ToSocketAddrs},
    sync::mpsc::{Receiver, Sender, channel},
    thread,
};

use crate::error::NetError;

pub(crate) type ResolveId = u64;

pub(crate) struct ResolveDone {
    pub id: ResolveId,
    pub result: Result<IpAddr, i32>,
}

struct Job {
    id: ResolveId,
    host: String,
}

/// Host resolution off the reactor thread.
///
/// getaddrinfo blocks, so lookups run on a lazily started worker; results
/// come back over a channel the reactor drains once per tick. Shutdown
/// just closes the job channel; a lookup already in flight finishes on its
/// own and the reply goes nowhere.
pub(crate) struct Resolver {
    jobs: Option<Sender<Job>>,
    done_tx: Sender<ResolveDone>,
    done_rx: Receiver<ResolveDone>,
    next_id: ResolveId,
}

impl Resolver {
    pub fn new() -> Self {
        let (done_tx, done_rx) = channel();
        Self { jobs: None, done_tx, done_rx, next_id: 0 }
    }

    pub fn lookup(&mut self, host: &str) -> ResolveId {
        self.ensure_worker();
        self.next_id += 1;
        let id = self.next_id;
        if let Some(jobs) = &self.jobs {
            let _ = jobs.send(Job { id, host: host.to_string() });
        }
        id
    }

    pub fn drain(&mut self, out: &mut Vec<ResolveDone>) {
        while let Ok(done) = self.done_rx.try_recv() {
            out.push(done);
        }
    }

    pub fn shutdown(&mut self) {
        self.jobs = None;
    }

    fn ensure_worker(&mut self) {
        if self.jobs.is_some() {
            return;
        }
        let (tx, rx) = channel::<Job>();
        let done = self.done_tx.clone();
        let spawned = thread::Builder::new().name("weft-resolver".into()).spawn(move || {
            while let Ok(job) = rx.recv() {
                let result = resolve(&job.host);
                if done.send(ResolveDone { id: job.id, result }).is_err() {
                    break;
                }
            }
        });
        match spawned {
            Ok(_) => self.jobs = Some(tx),
            Err(err) => tracing::error!(?err, "resolver worker spawn failed"),
        }
    }
}

fn resolve(host: &str) -> Result<IpAddr, i32> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(ip);
    }
    match (host, 0u16).to_socket_addrs() {
        Ok(mut addrs) => addrs.next().map(|a| a.ip()).ok_or_else(|| NetError::InvalidUrl.code()),
        Err(_) => Err(NetError::InvalidUrl.code()),
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use super::*;

    #[test]
    fn resolves_literals_and_localhost() {
        let mut resolver = Resolver::new();
        let a = resolver.lookup("127.0.0.1");
        let b = resolver.lookup("localhost");

        let mut done = Vec::new();
        for _ in 0..200 {
            resolver.drain(&mut done);
            if done.len() == 2 {
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(done.len(), 2);
        for d in done {
            assert!(d.id == a || d.id == b);
            assert!(d.result.is_ok(), "{:?}", d.result);
        }
    }
}
