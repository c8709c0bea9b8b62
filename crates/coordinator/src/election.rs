//! Leader election
//!
//! Each round reads the rendezvous record:
//! - present: connect and check it answers; on failure clear exactly that record
//!   (compare-and-clear) and retry
//! - absent: bind a listener and publish its address with create-if-absent;
//!   the single winner leads, everyone else retries and follows
//!
//! The rendezvous record is only touched between rounds, never while a
//! request to the leader is outstanding.

use tokio::net::TcpListener;
use tracing::{debug, info, instrument, warn};

use crate::config::CoordinatorConfig;
use crate::error::CoordinatorError;
use crate::protocol::SharedKey;
use crate::proxy::Proxy;
use crate::rendezvous::{EndpointRecord, Publish, Rendezvous};

/// Outcome of a successful election
pub(crate) enum Elected<K: SharedKey> {
    /// This process published its endpoint and leads
    Leader {
        listener: TcpListener,
        record: EndpointRecord,
    },
    /// Another process leads; `proxy` is connected and answered a liveness check
    Follower {
        proxy: Proxy<K>,
        record: EndpointRecord,
    },
}

/// Elect a leader for `config.name`, retrying with a fixed backoff
#[instrument(skip_all, fields(name = %config.name))]
pub(crate) async fn elect<K: SharedKey>(
    config: &CoordinatorConfig,
    rendezvous: &dyn Rendezvous,
) -> Result<Elected<K>, CoordinatorError> {
    for attempt in 1..=config.max_election_attempts {
        if attempt > 1 {
            tokio::time::sleep(config.election_backoff).await;
        }

        match rendezvous.read(&config.name).await? {
            Some(record) => match follow(&record, config).await {
                Ok(proxy) => return Ok(Elected::Follower { proxy, record }),
                Err(e) => {
                    warn!(
                        attempt,
                        addr = %record.addr,
                        pid = record.pid,
                        published_at = %record.published_at,
                        error = %e,
                        "Published coordinator is unreachable, clearing its record"
                    );
                    rendezvous.clear_if(&config.name, &record).await?;
                }
            },
            None => {
                let listener = TcpListener::bind((config.host.as_str(), 0)).await?;
                let record = EndpointRecord::new(listener.local_addr()?);

                match rendezvous.publish_if_absent(&config.name, &record).await? {
                    Publish::Published => {
                        info!(attempt, addr = %record.addr, "Won coordinator election");
                        return Ok(Elected::Leader { listener, record });
                    }
                    Publish::Occupied(winner) => {
                        debug!(attempt, winner = %winner.addr, "Lost coordinator election race");
                    }
                }
            }
        }
    }

    Err(CoordinatorError::ElectionFailed {
        name: config.name.clone(),
        attempts: config.max_election_attempts,
    })
}

/// Connect to a published leader and check that it answers
async fn follow<K: SharedKey>(
    record: &EndpointRecord,
    config: &CoordinatorConfig,
) -> Result<Proxy<K>, CoordinatorError> {
    let proxy = Proxy::connect(record.addr, config).await?;
    proxy.check_alive(config.liveness_timeout).await?;
    Ok(proxy)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rendezvous::InMemoryRendezvous;
    use std::time::Duration;

    fn config() -> CoordinatorConfig {
        CoordinatorConfig::new("election-test")
            .with_election(3, Duration::from_millis(5))
            .with_connect_timeout(Duration::from_millis(200))
    }

    #[tokio::test]
    async fn test_empty_rendezvous_elects_self() {
        let rendezvous = InMemoryRendezvous::new();
        let elected = elect::<u32>(&config(), &rendezvous).await.unwrap();

        let Elected::Leader { listener, record } = elected else {
            panic!("expected to lead");
        };
        assert_eq!(listener.local_addr().unwrap(), record.addr);
        assert_eq!(
            rendezvous.read("election-test").await.unwrap(),
            Some(record)
        );
    }

    #[tokio::test]
    async fn test_stale_record_is_replaced() {
        let rendezvous = InMemoryRendezvous::new();

        // Bind then drop a listener to get an address nobody serves
        let dead = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let stale = EndpointRecord::new(dead.local_addr().unwrap());
        drop(dead);
        rendezvous.insert("election-test", stale.clone());

        let elected = elect::<u32>(&config(), &rendezvous).await.unwrap();
        let Elected::Leader { record, .. } = elected else {
            panic!("expected to lead after clearing the stale record");
        };
        assert_ne!(record, stale);
        assert_eq!(rendezvous.read("election-test").await.unwrap(), Some(record));
    }
}
