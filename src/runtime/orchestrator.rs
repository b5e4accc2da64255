//! Wires pollers, workers and load generators together for one run.
//!
//! Startup order: every poller is initialised (publishing its endpoint)
//! before any thread starts; then poller threads, worker threads bound
//! round-robin to the poller queues, and finally the clients. Shutdown runs
//! the other way: pollers exit on their own once their expected closures are
//! seen, after which each worker receives one shutdown message on its own
//! queue.

use crate::config::{Config, Mode};
use crate::error::{Error, Result};
use crate::runtime::loadgen::{Client, LoadProfile};
use crate::runtime::message::Message;
use crate::runtime::poller::{Dispatch, Poller};
use crate::runtime::queue::ExchangeQueue;
use crate::runtime::stats::Report;
use crate::runtime::transport::Transport;
use crate::runtime::worker::Worker;
use socket2::SockAddr;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{error, info};

/// Expected closures per poller.
///
/// Each client spreads `connections` round-robin over `pollers` endpoints, so
/// poller `i` receives `connections / pollers` connections from every client,
/// plus one more from every client while `i < connections % pollers`. Any two
/// pollers therefore differ by at most `clients` connections.
pub fn partition(connections: usize, pollers: usize, clients: usize) -> Vec<usize> {
    (0..pollers)
        .map(|i| {
            let share = connections / pollers + usize::from(i < connections % pollers);
            share * clients
        })
        .collect()
}

/// Runs one full ping/pong session.
pub struct Orchestrator {
    config: Config,
    transport: Arc<dyn Transport>,
}

impl Orchestrator {
    pub fn new(config: Config, transport: Arc<dyn Transport>) -> Self {
        Self { config, transport }
    }

    /// Start every role, wait for the load to complete, and collect counters.
    pub fn run(&self) -> Result<Report> {
        let config = &self.config;
        let expected = partition(config.connections, config.pollers, config.clients);

        let mut pollers = Vec::with_capacity(config.pollers);
        let mut queues = Vec::with_capacity(config.pollers);
        for id in 0..config.pollers {
            let dispatch = match config.mode {
                Mode::Queued => {
                    let queue = Arc::new(ExchangeQueue::new(config.queue_capacity));
                    queues.push(Arc::clone(&queue));
                    Dispatch::Queue(queue)
                }
                Mode::Direct => Dispatch::Inline,
            };
            pollers.push(Poller::init(
                id,
                self.transport.as_ref(),
                dispatch,
                config.max_events,
                config.poll_timeout,
            )?);
        }
        let endpoints: Arc<[SockAddr]> = pollers.iter().map(|p| p.local_addr().clone()).collect();

        // Worker w drains queue w % pollers, so every queue has a consumer.
        let worker_queues: Vec<_> = if queues.is_empty() {
            Vec::new()
        } else {
            (0..config.workers)
                .map(|w| Arc::clone(&queues[w % queues.len()]))
                .collect()
        };

        info!(
            mode = ?config.mode,
            transport = self.transport.name(),
            pollers = config.pollers,
            workers = worker_queues.len(),
            clients = config.clients,
            ?expected,
            "Starting run"
        );

        let poller_handles = pollers
            .into_iter()
            .zip(expected)
            .enumerate()
            .map(|(id, (mut poller, closures))| {
                spawn_role(format!("poller-{id}"), move || poller.run(closures))
            })
            .collect::<Result<Vec<_>>>()?;

        let worker_handles = worker_queues
            .iter()
            .enumerate()
            .map(|(id, queue)| {
                let worker = Worker::new(id, Arc::clone(queue));
                spawn_role(format!("worker-{id}"), move || worker.run())
            })
            .collect::<Result<Vec<_>>>()?;

        let profile = LoadProfile {
            connections: config.connections,
            messages: config.messages,
            max_events: config.max_events,
            timeout: config.client_timeout,
        };
        let client_handles = (0..config.clients)
            .map(|id| {
                let transport = Arc::clone(&self.transport);
                let endpoints = Arc::clone(&endpoints);
                spawn_role(format!("client-{id}"), move || {
                    Client::connect(id, transport.as_ref(), &endpoints, profile)?.run()
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let pollers = join_all(poller_handles)?;

        for queue in &worker_queues {
            queue.push(Message::Shutdown);
        }
        let workers = join_all(worker_handles)?;
        let clients = join_all(client_handles)?;

        Ok(Report {
            pollers,
            workers,
            clients,
        })
    }
}

/// Spawn a named role thread. A role error is fatal for the whole process:
/// the other roles would otherwise wait forever on work that never comes.
fn spawn_role<T, F>(name: String, body: F) -> Result<JoinHandle<T>>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    let thread_name = name.clone();
    thread::Builder::new()
        .name(name)
        .spawn(move || match body() {
            Ok(value) => value,
            Err(e) => {
                error!(thread = %thread_name, error = %e, "Fatal error");
                std::process::exit(1);
            }
        })
        .map_err(|e| Error::setup("spawn thread", e))
}

fn join_all<T>(handles: Vec<JoinHandle<T>>) -> Result<Vec<T>> {
    handles
        .into_iter()
        .map(|handle| {
            let name = handle.thread().name().unwrap_or("unnamed").to_string();
            handle.join().map_err(|_| Error::Thread(name))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransportKind;
    use crate::runtime::transport::{self, TcpLoopback, UnixAbstract};
    use std::time::Duration;

    fn config(mode: Mode, pollers: usize, workers: usize, connections: usize) -> Config {
        Config {
            transport: TransportKind::Tcp,
            mode,
            pollers,
            workers,
            queue_capacity: 64,
            max_events: 32,
            poll_timeout: Duration::from_millis(1),
            clients: 1,
            connections,
            messages: 5,
            client_timeout: Duration::from_millis(1),
            log_level: "info".to_string(),
        }
    }

    #[test]
    fn test_partition_fairness() {
        let shares = partition(100, 3, 4);
        assert_eq!(shares, vec![136, 132, 132]);
        assert_eq!(shares.iter().sum::<usize>(), 400);

        let max = shares.iter().max().unwrap();
        let min = shares.iter().min().unwrap();
        assert!(max - min <= 4);
    }

    #[test]
    fn test_partition_even_and_sparse() {
        assert_eq!(partition(10, 1, 1), vec![10]);
        assert_eq!(partition(9, 3, 2), vec![6, 6, 6]);
        // Fewer connections than pollers leaves later pollers idle.
        assert_eq!(partition(2, 4, 1), vec![1, 1, 0, 0]);
    }

    #[test]
    fn test_end_to_end_queued() {
        let orchestrator = Orchestrator::new(config(Mode::Queued, 1, 2, 10), Arc::new(TcpLoopback));
        let report = orchestrator.run().unwrap();

        assert_eq!(report.pollers.len(), 1);
        assert_eq!(report.workers.len(), 2);
        assert_eq!(report.replies(), 50);
        assert_eq!(report.client_replies(), 50);
        assert_eq!(report.closed(), 10);
        assert_eq!(report.pollers[0].accepted, 10);

        let closes: u64 = report.workers.iter().map(|w| w.closes).sum();
        assert_eq!(closes, 10);
        assert!(report.histogram().total_waits() > 0);
    }

    #[test]
    fn test_end_to_end_unix_multi_poller() {
        let mut config = config(Mode::Queued, 2, 3, 7);
        config.clients = 2;
        config.transport = TransportKind::Unix;

        let report = Orchestrator::new(config, transport::from_kind(TransportKind::Unix))
            .run()
            .unwrap();

        assert_eq!(report.replies(), 2 * 7 * 5);
        assert_eq!(report.client_replies(), 2 * 7 * 5);
        assert_eq!(report.pollers[0].closed, 8);
        assert_eq!(report.pollers[1].closed, 6);
    }

    #[test]
    fn test_end_to_end_direct() {
        let orchestrator = Orchestrator::new(config(Mode::Direct, 2, 0, 6), Arc::new(UnixAbstract));
        let report = orchestrator.run().unwrap();

        assert!(report.workers.is_empty());
        assert_eq!(report.overflows(), 0);
        assert_eq!(report.replies(), 30);
        assert_eq!(report.closed(), 6);
    }
}
