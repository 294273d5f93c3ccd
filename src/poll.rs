//! The poll loop.
//!
//! Bootstrapping connects to every registered host once and, in socket mode,
//! forwards each host's control socket. Every steady cycle then fetches all
//! inventories concurrently and hands the result to a [`Presenter`]. The
//! first cycle also opens the requested container tunnels; later cycles never
//! touch them again.

use crate::allocator::ForwardAllocator;
use crate::batch::run_batch;
use crate::config::{Config, InventoryMode, TunnelSelection};
use crate::container::{Container, Tunnel};
use crate::errors::{Error, Result};
use crate::forward::{close_all, establish_tunnels, forward_control_socket, plan_tunnels, Forward};
use crate::inventory::{CommandInventory, InventorySource, SocketInventory};
use crate::registry::{HostRegistry, HostTarget};
use crate::render::Presenter;
use crate::session::{connect_all, Connector, RemoteSession};
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Containers of one host that answered during a cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollCycleResult {
    pub target: HostTarget,
    pub containers: Vec<Container>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Bootstrapping,
    Steady { cycle: u64 },
}

/// Everything bootstrapping established. Lives until shutdown.
struct Fleet<S> {
    sessions: HashMap<HostTarget, Arc<S>>,
    inventory: Box<dyn InventorySource>,
    forwards: Vec<Forward>,
    tunnels: HashMap<(HostTarget, String), Tunnel>,
}

impl<S> Fleet<S> {
    /// No sessions yet, and an inventory that knows no host.
    fn empty() -> Self {
        Self {
            sessions: HashMap::new(),
            inventory: Box::new(SocketInventory::default()),
            forwards: Vec::new(),
            tunnels: HashMap::new(),
        }
    }
}

pub struct PollLoop<C, P> {
    config: Config,
    connector: C,
    presenter: P,
    allocator: ForwardAllocator,
    phase: Phase,
}

impl<C: Connector, P: Presenter> PollLoop<C, P> {
    pub fn new(config: Config, connector: C, presenter: P) -> Self {
        let allocator = ForwardAllocator::new(config.pool_start, config.pool_end);
        Self {
            config,
            connector,
            presenter,
            allocator,
            phase: Phase::Bootstrapping,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn allocator(&self) -> &ForwardAllocator {
        &self.allocator
    }

    /// Bootstrap, then poll until `shutdown` resolves.
    ///
    /// Only an empty registry or an unusable local socket directory end the
    /// run early; per-host failures are logged and skipped. `shutdown` is
    /// honoured during bootstrap too. Whatever was established by then is
    /// torn down the same way: every forward first, then the sessions.
    pub async fn run<R, F>(&mut self, registry: &R, shutdown: F) -> Result<()>
    where
        R: HostRegistry + ?Sized,
        F: Future<Output = ()>,
    {
        self.config.validate()?;
        let selection = std::mem::take(&mut self.config.tunnels);
        tokio::pin!(shutdown);

        let mut fleet = Fleet::empty();
        let booted = tokio::select! {
            biased;
            _ = &mut shutdown => None,
            res = self.bootstrap(registry, &mut fleet) => Some(res),
        };
        match booted {
            None => info!("shutting down during bootstrap"),
            Some(Err(err)) => {
                self.shutdown(fleet).await;
                return Err(err);
            }
            Some(Ok(())) => {
                let polling = async {
                    let results = self.first_cycle(&mut fleet, selection).await;
                    self.present(&results);
                    loop {
                        tokio::time::sleep(self.config.interval).await;
                        let results = self.cycle(&fleet).await;
                        self.present(&results);
                    }
                };
                tokio::select! {
                    biased;
                    _ = &mut shutdown => info!("shutting down"),
                    _ = polling => {}
                }
            }
        }

        self.shutdown(fleet).await;
        Ok(())
    }

    /// Connect and, in socket mode, forward control sockets.
    ///
    /// Sessions land in `fleet` before any forward is attempted, so a
    /// bootstrap cut short still leaves them there to be closed. Forwards
    /// still in flight at that point clean up when dropped.
    async fn bootstrap<R>(&mut self, registry: &R, fleet: &mut Fleet<C::Session>) -> Result<()>
    where
        R: HostRegistry + ?Sized,
    {
        self.phase = Phase::Bootstrapping;
        let targets = registry.targets()?;
        info!("bootstrapping {} hosts", targets.len());
        fleet.sessions = connect_all(&self.connector, &targets, self.config.connect_timeout).await;

        fleet.inventory = match self.config.inventory {
            InventoryMode::Command => Box::new(CommandInventory::new(fleet.sessions.clone())),
            InventoryMode::Socket => {
                let sockets = self.forward_control_sockets(fleet).await?;
                Box::new(SocketInventory::new(sockets))
            }
        };
        Ok(())
    }

    /// Forward one control socket per reachable host.
    ///
    /// Hosts whose forward fails are disconnected and dropped for the rest of
    /// the run. Failing every host is fatal only when each failure was a
    /// local bind; remote refusals leave an empty fleet that keeps polling.
    async fn forward_control_sockets(
        &self,
        fleet: &mut Fleet<C::Session>,
    ) -> Result<HashMap<HostTarget, PathBuf>> {
        if fleet.sessions.is_empty() {
            return Ok(HashMap::new());
        }
        let dir = &self.config.socket_dir;
        if let Err(err) = prepare_socket_dir(dir).await {
            error!("unusable socket directory {}: {err}", dir.display());
            return Err(Error::NoLocalEndpoint);
        }

        let timeout = self.config.forward_timeout;
        let ops = fleet.sessions.iter().map(|(target, session)| {
            let session = session.clone();
            let owner = target.clone();
            let local = self.config.socket_path(target);
            let remote = self.config.remote_socket.clone();
            (target.clone(), async move {
                forward_control_socket(session, &owner, &local, &remote, timeout).await
            })
        });
        let outcome = run_batch("control socket", ops, timeout + Duration::from_secs(1)).await;

        if outcome.ok.is_empty() && outcome.failed.iter().all(|(_, err)| err.is_local_bind()) {
            error!("no control socket could be bound under {}", dir.display());
            return Err(Error::NoLocalEndpoint);
        }
        for (target, _) in &outcome.failed {
            if let Some(session) = fleet.sessions.remove(target) {
                if let Err(err) = session.close().await {
                    debug!("closing {target}: {err}");
                }
            }
        }

        let mut sockets = HashMap::new();
        for (target, forward) in outcome.ok {
            sockets.insert(target.clone(), self.config.socket_path(&target));
            fleet.forwards.push(forward);
        }
        if sockets.is_empty() {
            warn!("no host accepted a control socket forward");
        } else {
            info!("{} control sockets forwarded", sockets.len());
        }
        Ok(sockets)
    }

    /// The first steady cycle, which also opens the selected tunnels.
    ///
    /// Taking `selection` by value keeps tunnels from being opened twice.
    async fn first_cycle(
        &mut self,
        fleet: &mut Fleet<C::Session>,
        selection: TunnelSelection,
    ) -> Vec<PollCycleResult> {
        let mut results = self.cycle(fleet).await;
        if selection.is_enabled() {
            self.open_tunnels(fleet, &results, &selection).await;
            for result in &mut results {
                annotate(&fleet.tunnels, result);
            }
        }
        results
    }

    async fn cycle(&mut self, fleet: &Fleet<C::Session>) -> Vec<PollCycleResult> {
        let cycle = match self.phase {
            Phase::Bootstrapping => 1,
            Phase::Steady { cycle } => cycle + 1,
        };
        self.phase = Phase::Steady { cycle };
        debug!("cycle {cycle}");

        let timeout = self.config.fetch_timeout;
        let include_all = self.config.include_all;
        let inventory = fleet.inventory.as_ref();
        let fetches = fleet.sessions.keys().map(|target| {
            (target.clone(), inventory.list_containers(target, include_all))
        });
        // libssh2 only sends a keepalive once one is due
        let keepalives = fleet
            .sessions
            .iter()
            .map(|(target, session)| (target.clone(), session.keepalive()));
        let (outcome, _) = tokio::join!(
            run_batch("fetch", fetches, timeout),
            run_batch("keepalive", keepalives, timeout),
        );
        if !outcome.failed.is_empty() {
            info!(
                "cycle {cycle}: {} of {} hosts answered",
                outcome.ok.len(),
                fleet.sessions.len()
            );
        }
        outcome
            .ok
            .into_iter()
            .map(|(target, containers)| {
                let mut result = PollCycleResult { target, containers };
                annotate(&fleet.tunnels, &mut result);
                result
            })
            .collect()
    }
    async fn open_tunnels(
        &self,
        fleet: &mut Fleet<C::Session>,
        results: &[PollCycleResult],
        selection: &TunnelSelection,
    ) {
        let mut plans = Vec::new();
        for result in results {
            let Some(session) = fleet.sessions.get(&result.target) else {
                continue;
            };
            let selected = result.containers.iter().filter(|c| selection.matches(&c.name));
            for plan in plan_tunnels(
                &result.target,
                selected,
                &self.allocator,
                self.config.tunnel_target,
            ) {
                plans.push((plan, session.clone()));
            }
        }
        if plans.is_empty() {
            info!("no containers to tunnel");
            return;
        }

        let planned = plans.len();
        let established = establish_tunnels(plans, self.config.forward_timeout).await;
        info!("{} of {planned} tunnels established", established.len());
        for (plan, forward) in established {
            info!("tunnel {plan}");
            fleet.tunnels.insert((plan.owner, plan.container), plan.tunnel);
            fleet.forwards.push(forward);
        }
    }

    fn present(&mut self, results: &[PollCycleResult]) {
        if let Err(err) = self.presenter.present(results) {
            warn!("could not render cycle: {err}");
        }
    }

    /// Close every forward, then every session. Returns the forwards that
    /// confirmed closure.
    async fn shutdown(&self, fleet: Fleet<C::Session>) -> usize {
        let total = fleet.forwards.len();
        let deadline = self.config.shutdown_timeout;
        let closed = close_all(&fleet.forwards, deadline / 2, deadline).await;
        if closed < total {
            warn!("{} of {total} forwards did not confirm closure", total - closed);
        } else {
            info!("closed {closed} forwards");
        }

        let ops = fleet
            .sessions
            .iter()
            .map(|(target, session)| (target.clone(), session.close()));
        run_batch("disconnect", ops, deadline).await;
        closed
    }
}

/// Create `dir` private to the current user, or refuse one others can enter.
async fn prepare_socket_dir(dir: &Path) -> io::Result<()> {
    tokio::fs::DirBuilder::new()
        .recursive(true)
        .mode(0o700)
        .create(dir)
        .await?;
    let mode = tokio::fs::metadata(dir).await?.permissions().mode() & 0o777;
    if mode & 0o077 != 0 {
        return Err(io::Error::new(
            io::ErrorKind::PermissionDenied,
            format!("accessible to other users (mode {mode:o})"),
        ));
    }
    Ok(())
}

fn annotate(tunnels: &HashMap<(HostTarget, String), Tunnel>, result: &mut PollCycleResult) {
    if tunnels.is_empty() {
        return;
    }
    for container in &mut result.containers {
        let key = (result.target.clone(), container.name.clone());
        container.tunnel = tunnels.get(&key).cloned();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::FakeConnector;
    use std::collections::BTreeSet;
    use std::net::Ipv4Addr;
    use std::sync::atomic::Ordering;
    use std::sync::Mutex;
    use tokio::time::Instant;
    use tokio_util::sync::CancellationToken;

    type Cycles = Arc<Mutex<Vec<Vec<PollCycleResult>>>>;

    /// Records every cycle and requests shutdown after `stop_after` of them.
    struct Recorder {
        cycles: Cycles,
        stop_after: usize,
        stop: CancellationToken,
    }

    impl Presenter for Recorder {
        fn present(&mut self, results: &[PollCycleResult]) -> Result<()> {
            let mut cycles = self.cycles.lock().unwrap();
            cycles.push(results.to_vec());
            if cycles.len() >= self.stop_after {
                self.stop.cancel();
            }
            Ok(())
        }
    }

    fn recorder(stop_after: usize) -> (Recorder, Cycles, CancellationToken) {
        let cycles = Cycles::default();
        let stop = CancellationToken::new();
        let rec = Recorder {
            cycles: cycles.clone(),
            stop_after,
            stop: stop.clone(),
        };
        (rec, cycles, stop)
    }

    fn command_config() -> Config {
        Config {
            inventory: InventoryMode::Command,
            interval: Duration::from_millis(10),
            connect_timeout: Duration::from_secs(2),
            fetch_timeout: Duration::from_millis(300),
            forward_timeout: Duration::from_secs(2),
            shutdown_timeout: Duration::from_secs(2),
            ..Default::default()
        }
    }

    fn socket_config(socket_dir: PathBuf) -> Config {
        Config {
            inventory: InventoryMode::Socket,
            socket_dir,
            ..command_config()
        }
    }

    fn hosts(cycle: &[PollCycleResult]) -> BTreeSet<String> {
        cycle.iter().map(|r| r.target.host.clone()).collect()
    }

    fn tunnel_of(result: &PollCycleResult, name: &str) -> Option<String> {
        result
            .containers
            .iter()
            .find(|c| c.name == name)
            .and_then(|c| c.tunnel.as_ref())
            .map(ToString::to_string)
    }

    const WEB: &str = "web<|>10.0.0.5:8080->80/tcp<|>Up 2 hours<|>nginx\n";

    #[tokio::test]
    async fn slow_host_rejoins_next_cycle() {
        let connector = FakeConnector::default()
            .listing("10.0.0.1", WEB)
            .listing("10.0.0.2", WEB)
            .hang_exec("10.0.0.2", 0)
            .refuse("10.0.0.3");
        let closed = connector.closed.clone();
        let keepalives = connector.keepalives.clone();
        let registry = vec![
            HostTarget::new("10.0.0.1", "root"),
            HostTarget::new("10.0.0.2", "root"),
            HostTarget::new("10.0.0.3", "root"),
        ];
        let (rec, cycles, stop) = recorder(2);
        let mut poll = PollLoop::new(command_config(), connector, rec);
        poll.run(&registry, stop.cancelled_owned()).await.unwrap();

        let cycles = cycles.lock().unwrap();
        assert_eq!(hosts(&cycles[0]), BTreeSet::from(["10.0.0.1".to_owned()]));
        assert_eq!(
            hosts(&cycles[1]),
            BTreeSet::from(["10.0.0.1".to_owned(), "10.0.0.2".to_owned()])
        );
        assert_eq!(cycles[1][0].containers[0].ports_display(), "10.0.0.5:8080:80");
        assert_eq!(poll.phase(), Phase::Steady { cycle: 2 });
        // one per connected session per cycle, the hung fetch included
        assert_eq!(keepalives.load(Ordering::SeqCst), 4);
        // the refused host never had a session
        assert_eq!(closed.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn tunnels_are_opened_once() {
        let listing = "web<|>10.0.0.5:48080->80/tcp<|>Up 2 hours<|>nginx\n\
                       db<|>5432/tcp<|>Up 2 hours<|>postgres\n";
        let connector = FakeConnector::default().listing("10.0.0.1", listing);
        let dials = connector.dials.clone();
        let config = Config {
            tunnels: TunnelSelection::All,
            pool_start: Ipv4Addr::new(127, 0, 1, 2),
            pool_end: Ipv4Addr::new(127, 0, 1, 10),
            ..command_config()
        };
        let (rec, cycles, stop) = recorder(3);
        let mut poll = PollLoop::new(config, connector, rec);
        poll.run(&vec![HostTarget::new("10.0.0.1", "root")], stop.cancelled_owned())
            .await
            .unwrap();

        let cycles = cycles.lock().unwrap();
        assert_eq!(cycles.len(), 3);
        for cycle in cycles.iter() {
            assert_eq!(
                tunnel_of(&cycle[0], "web").as_deref(),
                Some("127.0.1.2:48080:10.0.0.5:48080")
            );
            // unpublished, so never tunnelled
            assert_eq!(tunnel_of(&cycle[0], "db"), None);
        }
        // the reachability check when the tunnel came up, nothing after
        assert_eq!(dials.load(Ordering::SeqCst), 1);
        assert_eq!(poll.allocator().assigned("10.0.0.1"), Some(Ipv4Addr::new(127, 0, 1, 2)));
        assert!(tokio::net::TcpStream::connect("127.0.1.2:48080").await.is_err());
    }

    #[tokio::test]
    async fn new_containers_after_first_cycle_stay_untunnelled() {
        let first = "web<|>10.0.0.5:48080->80/tcp<|>Up 2 hours<|>nginx\n";
        let second = "web<|>10.0.0.5:48090->80/tcp<|>Up 1 second<|>nginx\n\
                      api<|>10.0.0.5:48091->8000/tcp<|>Up 1 second<|>api\n";
        let connector = FakeConnector::default().script("10.0.0.1", &[first, second]);
        let dials = connector.dials.clone();
        let config = Config {
            pool_start: Ipv4Addr::new(127, 0, 3, 2),
            pool_end: Ipv4Addr::new(127, 0, 3, 10),
            ..command_config()
        };
        let (rec, _, _) = recorder(usize::MAX);
        let mut poll = PollLoop::new(config, connector, rec);

        let mut fleet = Fleet::empty();
        poll.bootstrap(&vec![HostTarget::new("10.0.0.1", "root")], &mut fleet)
            .await
            .unwrap();
        let results = poll.first_cycle(&mut fleet, TunnelSelection::All).await;
        assert_eq!(
            tunnel_of(&results[0], "web").as_deref(),
            Some("127.0.3.2:48080:10.0.0.5:48080")
        );

        let results = poll.cycle(&fleet).await;
        assert_eq!(results[0].containers.len(), 2);
        let web = results[0].containers.iter().find(|c| c.name == "web").unwrap();
        assert_eq!(web.ports_display(), "10.0.0.5:48090:80");
        // still the tunnel opened on the first cycle
        assert_eq!(
            tunnel_of(&results[0], "web").as_deref(),
            Some("127.0.3.2:48080:10.0.0.5:48080")
        );
        assert_eq!(tunnel_of(&results[0], "api"), None);

        assert_eq!(dials.load(Ordering::SeqCst), 1);
        assert_eq!(fleet.forwards.len(), 1);
        assert_eq!(fleet.tunnels.len(), 1);
        assert_eq!(poll.allocator().assigned("10.0.0.1"), Some(Ipv4Addr::new(127, 0, 3, 2)));
        assert!(tokio::net::TcpStream::connect("127.0.3.2:48091").await.is_err());

        assert_eq!(poll.shutdown(fleet).await, 1);
    }

    #[tokio::test]
    async fn shutdown_closes_every_forward() {
        let listing: String = (1..=5)
            .map(|i| format!("app{i}<|>10.0.0.5:{}->80/tcp<|>Up 1 hour<|>app\n", 48100 + i))
            .collect();
        let connector = FakeConnector::default().listing("10.0.0.1", &listing);
        let closed = connector.closed.clone();
        let config = Config {
            pool_start: Ipv4Addr::new(127, 0, 2, 2),
            pool_end: Ipv4Addr::new(127, 0, 2, 10),
            ..command_config()
        };
        let (rec, _, _) = recorder(usize::MAX);
        let mut poll = PollLoop::new(config, connector, rec);

        let mut fleet = Fleet::empty();
        poll.bootstrap(&vec![HostTarget::new("10.0.0.1", "root")], &mut fleet)
            .await
            .unwrap();
        let results = poll.first_cycle(&mut fleet, TunnelSelection::All).await;
        assert_eq!(results[0].containers.len(), 5);
        assert_eq!(fleet.forwards.len(), 5);

        let forwards_closed = poll.shutdown(fleet).await;
        assert_eq!(forwards_closed, 5);
        assert_eq!(closed.load(Ordering::SeqCst), 1);
        for port in 48101..=48105 {
            assert!(tokio::net::TcpStream::connect(("127.0.2.2", port)).await.is_err());
        }
    }

    #[tokio::test]
    async fn control_sockets_forwarded_per_host() {
        let dir = tempfile::tempdir().unwrap();
        let config = socket_config(dir.path().join("sockets"));
        let registry = vec![
            HostTarget::new("10.0.0.1", "root"),
            HostTarget::new("10.0.0.2", "admin"),
        ];
        let connector = FakeConnector::default();
        let closed = connector.closed.clone();
        let (rec, _, _) = recorder(usize::MAX);
        let mut poll = PollLoop::new(config.clone(), connector, rec);

        let mut fleet = Fleet::empty();
        poll.bootstrap(&registry, &mut fleet).await.unwrap();
        assert_eq!(fleet.forwards.len(), 2);
        let mode = std::fs::metadata(&config.socket_dir).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o700);
        for target in &registry {
            assert!(config.socket_path(target).exists());
        }

        assert_eq!(poll.shutdown(fleet).await, 2);
        assert_eq!(closed.load(Ordering::SeqCst), 2);
        for target in &registry {
            assert!(!config.socket_path(target).exists());
        }
    }

    #[tokio::test]
    async fn refused_control_sockets_leave_an_empty_fleet() {
        let dir = tempfile::tempdir().unwrap();
        let connector = FakeConnector::default()
            .reject_dial("10.0.0.1")
            .reject_dial("10.0.0.2");
        let closed = connector.closed.clone();
        let registry = vec![
            HostTarget::new("10.0.0.1", "root"),
            HostTarget::new("10.0.0.2", "root"),
        ];
        let (rec, cycles, stop) = recorder(2);
        let mut poll = PollLoop::new(socket_config(dir.path().join("sockets")), connector, rec);
        poll.run(&registry, stop.cancelled_owned()).await.unwrap();

        let cycles = cycles.lock().unwrap();
        assert_eq!(cycles.len(), 2);
        assert!(cycles.iter().all(Vec::is_empty));
        // both dropped after their forward failed
        assert_eq!(closed.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn unbindable_control_sockets_are_fatal() {
        let dir = tempfile::tempdir().unwrap();
        // longer than a unix socket path may be
        let config = socket_config(dir.path().join("s".repeat(120)));
        let connector = FakeConnector::default();
        let closed = connector.closed.clone();
        let (rec, cycles, _) = recorder(usize::MAX);
        let mut poll = PollLoop::new(config, connector, rec);
        let err = poll
            .run(&vec![HostTarget::new("10.0.0.1", "root")], std::future::pending())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NoLocalEndpoint));
        assert!(cycles.lock().unwrap().is_empty());
        assert_eq!(closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unusable_socket_dir_is_fatal() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let (rec, _, _) = recorder(usize::MAX);
        let mut poll = PollLoop::new(
            socket_config(file.path().join("sockets")),
            FakeConnector::default(),
            rec,
        );
        let err = poll
            .run(&vec![HostTarget::new("10.0.0.1", "root")], std::future::pending())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NoLocalEndpoint));
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn shared_socket_dir_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let shared = dir.path().join("sockets");
        std::fs::create_dir(&shared).unwrap();
        std::fs::set_permissions(&shared, std::fs::Permissions::from_mode(0o755)).unwrap();
        let config = socket_config(shared);
        let (rec, _, _) = recorder(usize::MAX);
        let mut poll = PollLoop::new(config.clone(), FakeConnector::default(), rec);
        let target = HostTarget::new("10.0.0.1", "root");
        let err = poll.run(&vec![target.clone()], std::future::pending()).await.unwrap_err();
        assert!(matches!(err, Error::NoLocalEndpoint));
        assert!(!config.socket_path(&target).exists());
    }

    #[tokio::test]
    async fn shutdown_during_bootstrap_closes_what_exists() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            forward_timeout: Duration::from_secs(5),
            ..socket_config(dir.path().join("sockets"))
        };
        let connector = FakeConnector::default().hang_dial("10.0.0.2");
        let closed = connector.closed.clone();
        let registry = vec![
            HostTarget::new("10.0.0.1", "root"),
            HostTarget::new("10.0.0.2", "root"),
        ];
        let (rec, cycles, _) = recorder(usize::MAX);
        let mut poll = PollLoop::new(config.clone(), connector, rec);

        let stop = CancellationToken::new();
        let trigger = stop.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            trigger.cancel();
        });
        let started = Instant::now();
        poll.run(&registry, stop.cancelled_owned()).await.unwrap();

        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(poll.phase(), Phase::Bootstrapping);
        assert!(cycles.lock().unwrap().is_empty());
        assert_eq!(closed.load(Ordering::SeqCst), 2);
        for target in &registry {
            assert!(!config.socket_path(target).exists());
        }
    }

    #[tokio::test]
    async fn empty_registry_is_fatal() {
        let (rec, cycles, _) = recorder(usize::MAX);
        let mut poll = PollLoop::new(command_config(), FakeConnector::default(), rec);
        let err = poll
            .run(&Vec::<HostTarget>::new(), std::future::pending())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::EmptyRegistry));
        assert!(cycles.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn unreachable_fleet_keeps_polling() {
        let connector = FakeConnector::default().refuse("10.0.0.1");
        let (rec, cycles, stop) = recorder(2);
        let mut poll = PollLoop::new(command_config(), connector, rec);
        poll.run(&vec![HostTarget::new("10.0.0.1", "root")], stop.cancelled_owned())
            .await
            .unwrap();
        let cycles = cycles.lock().unwrap();
        assert!(cycles.len() >= 2);
        assert!(cycles.iter().all(Vec::is_empty));
    }
}
