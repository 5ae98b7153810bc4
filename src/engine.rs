//! The forwarding engine
//!
//! One coordinating task owns the router state and every writer. Reader
//! tasks (one per handle) feed a single channel; the engine drains it and
//! services events strictly one at a time, so a source chunk is always
//! routed to completion, including the flush of every endpoint, before
//! the next event is observed.

use anyhow::{bail, Context, Result};
use tokio::sync::mpsc;

use crate::config::Settings;
use crate::endpoint::{spawn_reader, Event, Origin, PtyEndpoint, SourcePort};
use crate::router::Router;

pub struct Engine {
    router: Router,
    source: SourcePort,
    endpoints: Vec<PtyEndpoint>,
}

impl Engine {
    pub fn new(settings: &Settings, source: SourcePort, endpoints: Vec<PtyEndpoint>) -> Self {
        debug_assert_eq!(endpoints.len(), settings.endpoint_count);
        Self {
            router: Router::new(
                settings.endpoint_count,
                settings.default_endpoint,
                settings.sticky,
            ),
            source,
            endpoints,
        }
    }

    /// Run the forwarding loop. Returns only on an irrecoverable
    /// condition: the protocol has no way to renumber or skip a collapsed
    /// handle (selector values are positional), so the first EOF or I/O
    /// failure on any handle terminates the whole engine.
    pub async fn run(mut self) -> Result<()> {
        let (tx, mut rx) = mpsc::channel::<Event>(256);

        spawn_reader(
            self.source.clone_reader().context("failed to clone source handle")?,
            Origin::Source,
            tx.clone(),
        );
        for (index, endpoint) in self.endpoints.iter().enumerate() {
            spawn_reader(
                endpoint
                    .clone_reader()
                    .with_context(|| format!("failed to clone endpoint {index} handle"))?,
                Origin::Endpoint(index),
                tx.clone(),
            );
        }
        drop(tx);

        while let Some(event) = rx.recv().await {
            match event {
                Event::Data(Origin::Source, chunk) => self.route_source_chunk(&chunk)?,
                Event::Data(origin @ Origin::Endpoint(_), chunk) => {
                    // Endpoint output is pure passthrough: verbatim, in
                    // order, no interpretation.
                    self.source
                        .write(&chunk)
                        .with_context(|| format!("write from {origin} to source failed"))?;
                    self.source.flush().context("source flush failed")?;
                }
                Event::Closed(origin) => {
                    bail!("{origin} closed; the stream cannot continue without it")
                }
                Event::Failed(origin, err) => {
                    return Err(err).with_context(|| format!("read from {origin} failed"))
                }
            }
        }

        bail!("all reader tasks stopped")
    }

    /// Run one just-read source chunk through the router, byte by byte,
    /// then flush every endpoint whether or not it received data.
    fn route_source_chunk(&mut self, chunk: &[u8]) -> Result<()> {
        for &byte in chunk {
            if let Some(index) = self.router.route(byte) {
                self.endpoints[index]
                    .write(&[byte])
                    .with_context(|| format!("write to endpoint {index} failed"))?;
            }
        }
        for (index, endpoint) in self.endpoints.iter_mut().enumerate() {
            endpoint
                .flush()
                .with_context(|| format!("flush of endpoint {index} failed"))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::{File, OpenOptions};
    use std::io::{Read, Write};
    use std::time::{Duration, Instant};

    /// A running engine wired to a pseudoterminal standing in for the
    /// source device, plus a client handle on each endpoint.
    struct TestRig {
        // Keeps the stand-in source pty alive for the test's duration.
        _source_pty: PtyEndpoint,
        /// Master side of the stand-in source: what a remote peer would
        /// see on the physical line.
        line: File,
        /// Opened slave handles on the engine's endpoints, in index order.
        clients: Vec<File>,
        task: tokio::task::JoinHandle<Result<()>>,
    }

    fn start_engine(count: usize, default: usize, sticky: bool) -> TestRig {
        let source_pty = PtyEndpoint::allocate().unwrap();
        let line = source_pty.clone_reader().unwrap();
        let source = SourcePort::open(&source_pty.path().to_string_lossy()).unwrap();

        let endpoints: Vec<PtyEndpoint> =
            (0..count).map(|_| PtyEndpoint::allocate().unwrap()).collect();
        let clients: Vec<File> = endpoints
            .iter()
            .map(|ep| {
                OpenOptions::new()
                    .read(true)
                    .write(true)
                    .open(ep.path())
                    .unwrap()
            })
            .collect();

        let settings = Settings::new(
            source_pty.path().to_string_lossy().into_owned(),
            count,
            default,
            sticky,
        )
        .unwrap();
        let engine = Engine::new(&settings, source, endpoints);
        let task = tokio::spawn(engine.run());

        TestRig {
            _source_pty: source_pty,
            line,
            clients,
            task,
        }
    }

    /// Read exactly `n` bytes, polling until a deadline. Fails the test
    /// with whatever arrived if the count is not reached in time.
    fn read_exact_bytes(file: &mut File, n: usize) -> Vec<u8> {
        let mut collected = Vec::new();
        let mut buf = [0u8; 64];
        let deadline = Instant::now() + Duration::from_secs(5);
        while collected.len() < n && Instant::now() < deadline {
            match file.read(&mut buf) {
                Ok(0) => break,
                Ok(got) => collected.extend_from_slice(&buf[..got]),
                Err(err) => panic!("read failed: {err}"),
            }
        }
        assert_eq!(collected.len(), n, "timed out, got {collected:x?}");
        collected
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_selector_routes_one_byte_then_reverts() {
        let mut rig = start_engine(2, 0, false);

        // Selector 1, payload 'A', payload 'B': 'A' goes to endpoint 1,
        // 'B' falls back to the default endpoint 0.
        rig.line.write_all(&[1, 0x41, 0x42]).unwrap();

        assert_eq!(read_exact_bytes(&mut rig.clients[1], 1), vec![0x41]);
        assert_eq!(read_exact_bytes(&mut rig.clients[0], 1), vec![0x42]);
        rig.task.abort();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_selectors_overwrite_without_emitting() {
        let mut rig = start_engine(3, 1, false);

        // N=3, default 1: selector 0 then selector 2, then payload 'X'.
        // Only endpoint 2 receives anything; a follow-up payload byte
        // lands on the default endpoint again.
        rig.line.write_all(&[0, 2, 0x58, 0x59]).unwrap();

        assert_eq!(read_exact_bytes(&mut rig.clients[2], 1), vec![0x58]);
        assert_eq!(read_exact_bytes(&mut rig.clients[1], 1), vec![0x59]);
        rig.task.abort();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_sticky_selection_keeps_routing() {
        let mut rig = start_engine(2, 0, true);

        rig.line.write_all(&[1, b'a', b'b', b'c']).unwrap();

        assert_eq!(read_exact_bytes(&mut rig.clients[1], 3), b"abc".to_vec());
        rig.task.abort();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_endpoint_output_passes_through_verbatim() {
        let mut rig = start_engine(2, 0, false);

        // Bytes below the endpoint count and a newline included: the
        // return direction applies no interpretation at all.
        let payload = [0u8, 1, b'h', b'i', b'\n'];
        rig.clients[0].write_all(&payload).unwrap();

        assert_eq!(read_exact_bytes(&mut rig.line, payload.len()), payload);
        rig.task.abort();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_both_directions_interleave() {
        let mut rig = start_engine(2, 0, false);

        rig.line.write_all(&[1, b'x']).unwrap();
        assert_eq!(read_exact_bytes(&mut rig.clients[1], 1), b"x".to_vec());

        rig.clients[1].write_all(b"reply").unwrap();
        assert_eq!(read_exact_bytes(&mut rig.line, 5), b"reply".to_vec());
        rig.task.abort();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_source_collapse_terminates_the_engine() {
        let rig = start_engine(1, 0, false);

        // Closing every handle on the stand-in source's master makes the
        // engine's source handle report EOF (or EIO, depending on the
        // platform); either way the engine must stop with an error.
        drop(rig.line);
        drop(rig._source_pty);

        let result = tokio::time::timeout(Duration::from_secs(5), rig.task)
            .await
            .expect("engine did not stop after source collapse")
            .expect("engine task panicked");
        assert!(result.is_err());
    }
}
