//! RFC 8305 §4-§8 Happy Eyeballs v2: a [`StreamDialer`] that races
//! staggered dual-stack connection attempts so a broken or slow IPv6
//! path never holds up a connection that IPv4 could complete quickly
//! (spec §4.7).

use async_trait::async_trait;
use std::collections::VecDeque;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;
use wayline_errors::WaylineError;
use wayline_stream::{Result, StreamConn, StreamDialer};

/// Per-family name resolution, the one piece of DNS knowledge this dialer
/// needs from its caller.
#[async_trait]
pub trait AddressResolver: Send + Sync + 'static {
    async fn lookup_ipv6(&self, host: &str) -> Result<Vec<IpAddr>>;
    async fn lookup_ipv4(&self, host: &str) -> Result<Vec<IpAddr>>;
}

/// Resolves both families with the system resolver via
/// [`tokio::net::lookup_host`], filtering by address family.
pub struct SystemResolver;

#[async_trait]
impl AddressResolver for SystemResolver {
    async fn lookup_ipv6(&self, host: &str) -> Result<Vec<IpAddr>> {
        lookup_family(host, |ip| ip.is_ipv6()).await
    }

    async fn lookup_ipv4(&self, host: &str) -> Result<Vec<IpAddr>> {
        lookup_family(host, |ip| ip.is_ipv4()).await
    }
}

async fn lookup_family(host: &str, keep: impl Fn(&IpAddr) -> bool) -> Result<Vec<IpAddr>> {
    // `lookup_host` wants a "host:port" pair; the port is discarded once
    // resolution is done, so any placeholder works.
    let probe = format!("{host}:0");
    let addrs = tokio::net::lookup_host(probe)
        .await
        .map_err(WaylineError::from)?;
    Ok(addrs.map(|a| a.ip()).filter(|ip| keep(ip)).collect())
}

const RESOLUTION_DELAY: Duration = Duration::from_millis(50);
const ATTEMPT_DELAY: Duration = Duration::from_millis(250);

/// Tuning knobs for [`HappyEyeballsDialer`]. The RFC 8305 defaults are
/// what production clients should use; tests shorten them to keep cases
/// fast without changing the algorithm under test.
#[derive(Clone, Copy, Debug)]
pub struct HappyEyeballsConfig {
    pub resolution_delay: Duration,
    pub attempt_delay: Duration,
}

impl Default for HappyEyeballsConfig {
    fn default() -> Self {
        Self {
            resolution_delay: RESOLUTION_DELAY,
            attempt_delay: ATTEMPT_DELAY,
        }
    }
}

/// A dual-stack [`StreamDialer`] implementing RFC 8305's staggered
/// connection algorithm over an inner dialer (typically a direct TCP
/// dialer) and a per-family resolver.
pub struct HappyEyeballsDialer {
    inner: Arc<dyn StreamDialer>,
    resolver: Arc<dyn AddressResolver>,
    config: HappyEyeballsConfig,
}

impl HappyEyeballsDialer {
    pub fn new(inner: Arc<dyn StreamDialer>, resolver: Arc<dyn AddressResolver>) -> Self {
        Self::with_config(inner, resolver, HappyEyeballsConfig::default())
    }

    pub fn with_config(
        inner: Arc<dyn StreamDialer>,
        resolver: Arc<dyn AddressResolver>,
        config: HappyEyeballsConfig,
    ) -> Self {
        Self {
            inner,
            resolver,
            config,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Family {
    V6,
    V4,
}

struct DialOutcome {
    ip: IpAddr,
    result: Result<Arc<dyn StreamConn>>,
}

#[async_trait]
impl StreamDialer for HappyEyeballsDialer {
    async fn dial(&self, address: &str) -> Result<Arc<dyn StreamConn>> {
        let (host, port) = split_host_port(address)?;

        if let Ok(ip) = host.parse::<IpAddr>() {
            return self.inner.dial(&SocketAddr::new(ip, port).to_string()).await;
        }

        self.race(host, port).await
    }
}

impl HappyEyeballsDialer {
    async fn race(&self, host: &str, port: u16) -> Result<Arc<dyn StreamConn>> {
        let mut ipv6_lookup: JoinHandle<Result<Vec<IpAddr>>> = {
            let resolver = self.resolver.clone();
            let host = host.to_string();
            tokio::spawn(async move { resolver.lookup_ipv6(&host).await })
        };
        let mut ipv4_lookup: JoinHandle<Result<Vec<IpAddr>>> = {
            let resolver = self.resolver.clone();
            let host = host.to_string();
            tokio::spawn(async move { resolver.lookup_ipv4(&host).await })
        };
        let mut ipv6_done = false;
        let mut ipv4_done = false;
        let mut ipv6_queue: VecDeque<IpAddr> = VecDeque::new();
        let mut ipv4_queue: VecDeque<IpAddr> = VecDeque::new();
        let mut last_family: Option<Family> = None;
        let mut dials_in_flight: usize = 0;
        let mut dial_tasks: Vec<JoinHandle<()>> = Vec::new();

        let mut lookup_errors: Vec<WaylineError> = Vec::new();
        let mut dial_errors: Vec<WaylineError> = Vec::new();

        let (result_tx, mut result_rx) = mpsc::unbounded_channel::<DialOutcome>();

        // Gate: a timer that must elapse before the next dial may start.
        // `None` while no IP is known yet; set once resolution or a dial
        // makes one of the two queues non-empty.
        let mut gate_deadline: Option<Instant> = None;

        loop {
            let lookups_outstanding = (!ipv6_done) as usize + (!ipv4_done) as usize;
            let ips_queued = ipv6_queue.len() + ipv4_queue.len();
            let pending = lookups_outstanding + ips_queued + dials_in_flight;
            if pending == 0 {
                break;
            }

            tokio::select! {
                res = &mut ipv6_lookup, if !ipv6_done => {
                    ipv6_done = true;
                    match res {
                        Ok(Ok(ips)) => ipv6_queue.extend(ips),
                        Ok(Err(err)) => lookup_errors.push(err),
                        Err(join_err) => lookup_errors.push(WaylineError::unsupported(join_err.to_string())),
                    }
                    arm_gate(&mut gate_deadline, &self.config, last_family.is_none(), &ipv6_queue, &ipv4_queue);
                }
                res = &mut ipv4_lookup, if !ipv4_done => {
                    ipv4_done = true;
                    match res {
                        Ok(Ok(ips)) => ipv4_queue.extend(ips),
                        Ok(Err(err)) => lookup_errors.push(err),
                        Err(join_err) => lookup_errors.push(WaylineError::unsupported(join_err.to_string())),
                    }
                    arm_gate(&mut gate_deadline, &self.config, last_family.is_none(), &ipv6_queue, &ipv4_queue);
                }
                _ = sleep_until_opt(gate_deadline), if gate_ready(gate_deadline, &ipv6_queue, &ipv4_queue, ipv6_done) => {
                    if let Some((ip, family)) = select_next_address(&mut ipv6_queue, &mut ipv4_queue, last_family) {
                        last_family = Some(family);
                        dials_in_flight += 1;
                        gate_deadline = Some(Instant::now() + self.config.attempt_delay);

                        let inner = self.inner.clone();
                        let tx = result_tx.clone();
                        let target = SocketAddr::new(ip, port).to_string();
                        debug!(target = %target, "happy-eyeballs: starting dial");
                        let handle = tokio::spawn(async move {
                            let result = inner.dial(&target).await;
                            let _ = tx.send(DialOutcome { ip, result });
                        });
                        dial_tasks.push(handle);
                    } else {
                        gate_deadline = None;
                    }
                }
                Some(outcome) = result_rx.recv(), if dials_in_flight > 0 => {
                    dials_in_flight -= 1;
                    match outcome.result {
                        Ok(conn) => {
                            for task in &dial_tasks {
                                task.abort();
                            }
                            if !ipv6_done {
                                ipv6_lookup.abort();
                            }
                            if !ipv4_done {
                                ipv4_lookup.abort();
                            }
                            return Ok(conn);
                        }
                        Err(err) => {
                            debug!(ip = %outcome.ip, error = %err, "happy-eyeballs: dial failed");
                            dial_errors.push(err);
                        }
                    }
                }
            }
        }

        if !dial_errors.is_empty() {
            Err(join_errors(dial_errors))
        } else if !lookup_errors.is_empty() {
            Err(join_errors(lookup_errors))
        } else {
            Err(WaylineError::unsupported(format!(
                "address lookup for {host} returned no IPs"
            )))
        }
    }
}

fn arm_gate(
    gate_deadline: &mut Option<Instant>,
    config: &HappyEyeballsConfig,
    no_prior_dial: bool,
    ipv6_queue: &VecDeque<IpAddr>,
    ipv4_queue: &VecDeque<IpAddr>,
) {
    if gate_deadline.is_some() {
        return;
    }
    if ipv6_queue.is_empty() && ipv4_queue.is_empty() {
        return;
    }
    let delay = if no_prior_dial {
        config.resolution_delay
    } else {
        config.attempt_delay
    };
    *gate_deadline = Some(Instant::now() + delay);
}

fn gate_ready(
    gate_deadline: Option<Instant>,
    ipv6_queue: &VecDeque<IpAddr>,
    ipv4_queue: &VecDeque<IpAddr>,
    _ipv6_done: bool,
) -> bool {
    gate_deadline.is_some() && (!ipv6_queue.is_empty() || !ipv4_queue.is_empty())
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(d) => tokio::time::sleep_until(d).await,
        None => std::future::pending().await,
    }
}

/// Alternates address families: IPv6 first when available, then
/// whichever family wasn't dialed last, falling back to whichever queue
/// is non-empty.
fn select_next_address(
    ipv6_queue: &mut VecDeque<IpAddr>,
    ipv4_queue: &mut VecDeque<IpAddr>,
    last_family: Option<Family>,
) -> Option<(IpAddr, Family)> {
    let want_v4 = match last_family {
        Some(Family::V6) if !ipv4_queue.is_empty() => true,
        None if ipv6_queue.is_empty() && !ipv4_queue.is_empty() => true,
        Some(Family::V4) if ipv6_queue.is_empty() && !ipv4_queue.is_empty() => true,
        _ => false,
    };

    if want_v4 {
        ipv4_queue.pop_front().map(|ip| (ip, Family::V4))
    } else if let Some(ip) = ipv6_queue.pop_front() {
        Some((ip, Family::V6))
    } else {
        ipv4_queue.pop_front().map(|ip| (ip, Family::V4))
    }
}

fn join_errors(errors: Vec<WaylineError>) -> WaylineError {
    let joined = errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ");
    WaylineError::unsupported(joined)
}

fn split_host_port(address: &str) -> Result<(&str, u16)> {
    let idx = address
        .rfind(':')
        .ok_or_else(|| WaylineError::unsupported(format!("address {address} missing port")))?;
    let (host, port_str) = (&address[..idx], &address[idx + 1..]);
    let host = host.trim_start_matches('[').trim_end_matches(']');
    let port: u16 = port_str
        .parse()
        .map_err(|_| WaylineError::unsupported(format!("address {address} has invalid port")))?;
    Ok((host, port))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct StubResolver {
        ipv6: Vec<IpAddr>,
        ipv4: Vec<IpAddr>,
        ipv6_hangs: bool,
    }

    #[async_trait]
    impl AddressResolver for StubResolver {
        async fn lookup_ipv6(&self, _host: &str) -> Result<Vec<IpAddr>> {
            if self.ipv6_hangs {
                std::future::pending().await
            } else {
                Ok(self.ipv6.clone())
            }
        }
        async fn lookup_ipv4(&self, _host: &str) -> Result<Vec<IpAddr>> {
            Ok(self.ipv4.clone())
        }
    }

    /// Records every address dialed, in order, and resolves per a fixed
    /// table of outcomes (default: failure).
    struct RecordingDialer {
        order: Mutex<Vec<String>>,
        succeed_on: Vec<String>,
    }

    impl RecordingDialer {
        fn new(succeed_on: Vec<String>) -> Self {
            Self {
                order: Mutex::new(Vec::new()),
                succeed_on,
            }
        }

        fn dialed(&self) -> Vec<String> {
            self.order.lock().unwrap().clone()
        }
    }

    #[derive(Debug)]
    struct FakeConn;

    #[async_trait]
    impl StreamConn for FakeConn {
        async fn read(&self, _buf: &mut [u8]) -> Result<usize> {
            Ok(0)
        }
        async fn write(&self, buf: &[u8]) -> Result<usize> {
            Ok(buf.len())
        }
        async fn close_read(&self) -> Result<()> {
            Ok(())
        }
        async fn close_write(&self) -> Result<()> {
            Ok(())
        }
        fn local_addr(&self) -> Option<SocketAddr> {
            None
        }
        fn peer_addr(&self) -> Option<SocketAddr> {
            None
        }
        fn as_any(&self) -> &dyn std::any::Any {
            self
        }
    }

    #[async_trait]
    impl StreamDialer for RecordingDialer {
        async fn dial(&self, address: &str) -> Result<Arc<dyn StreamConn>> {
            self.order.lock().unwrap().push(address.to_string());
            if self.succeed_on.iter().any(|a| a == address) {
                Ok(Arc::new(FakeConn))
            } else {
                Err(WaylineError::unsupported(format!("dial {address}")))
            }
        }
    }

    fn v6(s: &str) -> IpAddr {
        s.parse().unwrap()
    }
    fn v4(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn balanced_lookups_alternate_starting_with_ipv6() {
        let resolver = Arc::new(StubResolver {
            ipv6: vec![v6("::1"), v6("::2"), v6("::3")],
            ipv4: vec![v4("1.1.1.1"), v4("2.2.2.2"), v4("3.3.3.3")],
            ipv6_hangs: false,
        });
        let dialer = Arc::new(RecordingDialer::new(vec![]));
        let happy = HappyEyeballsDialer::with_config(
            dialer.clone(),
            resolver,
            HappyEyeballsConfig {
                resolution_delay: Duration::from_millis(5),
                attempt_delay: Duration::from_millis(5),
            },
        );

        let err = happy.dial("example.com:53").await.unwrap_err();
        assert!(err.to_string().contains("dial"));

        let order = dialer.dialed();
        assert_eq!(
            order,
            vec![
                "[::1]:53",
                "1.1.1.1:53",
                "[::2]:53",
                "2.2.2.2:53",
                "[::3]:53",
                "3.3.3.3:53",
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn ipv4_is_used_when_ipv6_lookup_hangs() {
        let resolver = Arc::new(StubResolver {
            ipv6: vec![],
            ipv4: vec![v4("8.8.8.8"), v4("8.8.4.4")],
            ipv6_hangs: true,
        });
        let dialer = Arc::new(RecordingDialer::new(vec!["8.8.4.4:53".to_string()]));
        let happy = HappyEyeballsDialer::with_config(
            dialer.clone(),
            resolver,
            HappyEyeballsConfig {
                resolution_delay: Duration::from_millis(5),
                attempt_delay: Duration::from_millis(5),
            },
        );

        happy.dial("example.com:53").await.unwrap();

        assert_eq!(dialer.dialed(), vec!["8.8.8.8:53", "8.8.4.4:53"]);
    }

    #[tokio::test]
    async fn literal_ip_dials_directly_without_lookup() {
        struct PanicResolver;
        #[async_trait]
        impl AddressResolver for PanicResolver {
            async fn lookup_ipv6(&self, _host: &str) -> Result<Vec<IpAddr>> {
                panic!("literal IPs must not trigger a lookup")
            }
            async fn lookup_ipv4(&self, _host: &str) -> Result<Vec<IpAddr>> {
                panic!("literal IPs must not trigger a lookup")
            }
        }

        let dialer = Arc::new(RecordingDialer::new(vec!["127.0.0.1:80".to_string()]));
        let happy = HappyEyeballsDialer::new(dialer.clone(), Arc::new(PanicResolver));

        happy.dial("127.0.0.1:80").await.unwrap();
        assert_eq!(dialer.dialed(), vec!["127.0.0.1:80"]);
    }
}
