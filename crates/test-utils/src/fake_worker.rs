use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Result, bail};
use dagcluster::protocol::{
    Channel, ForwardedOutput, MASTER, Message, Rank, Registration, TaskCommand, TaskResult,
};

/// One COMMAND as seen by a [`FakeWorker`].
#[derive(Debug, Clone)]
pub struct Dispatch {
    pub rank: Rank,
    pub host_rank: u32,
    pub command: TaskCommand,
}

/// Dispatch log shared by every fake worker of a test, in arrival order.
pub type DispatchLog = Arc<Mutex<Vec<Dispatch>>>;

/// Exit codes per task name, consumed one per attempt.
pub type ExitScript = Arc<Mutex<HashMap<String, VecDeque<i32>>>>;

/// A worker that speaks the protocol but never starts a process:
/// - registers the given resources and waits for its host rank
/// - optionally meets the master at the host-script barrier
/// - answers each COMMAND with a scripted exit code after `delay`
/// - returns the task name as the bytes of every pipe forwarding.
pub struct FakeWorker<C: Channel> {
    channel: C,
    registration: Registration,
    exit_codes: ExitScript,
    delay: Duration,
    barrier: bool,
    log: DispatchLog,
}

impl<C: Channel> FakeWorker<C> {
    pub fn new(channel: C, registration: Registration, log: DispatchLog) -> Self {
        Self {
            channel,
            registration,
            exit_codes: Arc::new(Mutex::new(HashMap::new())),
            delay: Duration::ZERO,
            barrier: false,
            log,
        }
    }

    /// Share one exit-code script between several workers.
    pub fn with_script(mut self, script: ExitScript) -> Self {
        self.exit_codes = script;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_barrier(mut self) -> Self {
        self.barrier = true;
        self
    }

    /// Serve until SHUTDOWN. Returns how many tasks this worker ran.
    pub async fn run(mut self) -> Result<usize> {
        let rank = self.channel.rank();
        self.channel
            .send(MASTER, &Message::Registration(self.registration.clone()))?;

        let host_rank = match self.channel.recv().await? {
            (MASTER, Message::HostRank(host_rank)) => host_rank,
            (from, msg) => bail!("rank {rank}: expected HOSTRANK, got {} from {from}", msg.kind()),
        };
        if self.barrier {
            self.channel.barrier().await?;
        }

        let mut ran = 0;
        loop {
            let command = match self.channel.recv().await? {
                (_, Message::Shutdown) => break,
                (_, Message::Command(command)) => command,
                (from, msg) => bail!("rank {rank}: unexpected {} from {from}", msg.kind()),
            };

            self.log.lock().unwrap().push(Dispatch {
                rank,
                host_rank,
                command: command.clone(),
            });

            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }

            let exit_code = self
                .exit_codes
                .lock()
                .unwrap()
                .get_mut(&command.name)
                .and_then(|codes| codes.pop_front())
                .unwrap_or(0);

            self.channel.send(
                MASTER,
                &Message::Result(TaskResult {
                    outputs: forwarded(&command),
                    name: command.name,
                    exit_code,
                    runtime: self.delay.as_secs_f64(),
                }),
            )?;
            ran += 1;
        }

        self.channel.close().await;
        Ok(ran)
    }
}

/// Build an exit-code script: each task name maps to the codes returned on
/// successive attempts. Attempts past the end of the list succeed.
pub fn script(entries: Vec<(&str, Vec<i32>)>) -> ExitScript {
    let map = entries
        .into_iter()
        .map(|(name, codes)| (name.to_string(), codes.into_iter().collect()))
        .collect();
    Arc::new(Mutex::new(map))
}

fn forwarded(command: &TaskCommand) -> Vec<ForwardedOutput> {
    command
        .pipe_forwards
        .iter()
        .map(|fwd| ForwardedOutput {
            dest: fwd.dest.clone(),
            data: format!("{}\n", command.name).into_bytes().into(),
        })
        .collect()
}
