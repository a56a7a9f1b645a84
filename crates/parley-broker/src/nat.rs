//! NAT classification from server-reflexive candidates.
//!
//! A throwaway transport gathers candidates against the configured STUN
//! servers. Every server-reflexive candidate maps a local (related) port to
//! an external port; one local port seen through several external ports
//! means the mapping depends on the destination, which is a symmetric NAT.

use crate::error::NatError;
use crate::policy::GatheringPolicy;
use crate::transport::{
    ChannelOptions, RtcConfig, TransportEvent, TransportFactory, TransportHandle,
};
use parley_proto::IceCandidate;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;

/// Gathering slower than this marks the shared policy slow
pub const SLOW_ICE_TIMEOUT: Duration = Duration::from_millis(3000);

/// Detection gives up gathering after this long
const GATHERING_CUTOFF: Duration = Duration::from_millis(3300);

/// NAT classification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NatType {
    /// One mapping for one local port, type undetermined
    Other,
    /// Destination-dependent mapping
    SymmetricNat,
    /// No reflexive mapping observed
    NoNat,
}

impl fmt::Display for NatType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Other => write!(f, "other"),
            Self::SymmetricNat => write!(f, "symmetric"),
            Self::NoNat => write!(f, "none"),
        }
    }
}

/// Result of [`detect_nat`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NatDetection {
    /// Classification
    pub nat: NatType,
    /// Whether gathering exceeded [`SLOW_ICE_TIMEOUT`]
    pub timeout: bool,
    /// Every candidate gathered
    pub candidates: Vec<IceCandidate>,
}

/// Classify a related-port to external-ports mapping
#[must_use]
pub fn classify(mappings: &BTreeMap<u16, BTreeSet<u16>>) -> NatType {
    let mut related = mappings.values();
    match (related.next(), related.next()) {
        (Some(external), None) if external.len() == 1 => NatType::Other,
        (Some(external), None) if external.len() > 1 => NatType::SymmetricNat,
        _ => NatType::NoNat,
    }
}

/// Gather candidates on a throwaway transport and classify the NAT
///
/// A gathering that outlasts [`SLOW_ICE_TIMEOUT`] marks `policy` slow.
///
/// # Errors
///
/// Returns [`NatError::Transport`] if the probe transport fails to start.
pub async fn detect_nat(
    factory: &dyn TransportFactory,
    config: &RtcConfig,
    policy: &GatheringPolicy,
) -> Result<NatDetection, NatError> {
    let TransportHandle {
        transport,
        mut events,
    } = factory.create(config)?;

    let started = Instant::now();
    let probe = async {
        let probe = transport.create_data_channel("probe", ChannelOptions::reliable())?;
        let offer = transport.create_offer().await?;
        transport.set_local_description(&offer).await?;
        Ok::<_, NatError>(probe)
    }
    .await;
    let probe = match probe {
        Ok(probe) => probe,
        Err(e) => {
            transport.close();
            return Err(e);
        }
    };

    let mut candidates = Vec::new();
    let mut mappings: BTreeMap<u16, BTreeSet<u16>> = BTreeMap::new();
    let deadline = started + GATHERING_CUTOFF;
    loop {
        let event = match tokio::time::timeout_at(deadline, events.recv()).await {
            Ok(Some(event)) => event,
            Ok(None) | Err(_) => break,
        };
        match event {
            TransportEvent::LocalCandidate(Some(candidate)) => {
                if candidate.is_server_reflexive() {
                    if let (Some(related), Some(port)) = (candidate.related_port(), candidate.port()) {
                        mappings.entry(related).or_default().insert(port);
                    }
                }
                candidates.push(candidate);
            }
            TransportEvent::LocalCandidate(None) => break,
            _ => {}
        }
    }

    probe.channel.close();
    transport.close();

    let timeout = started.elapsed() > SLOW_ICE_TIMEOUT;
    if timeout {
        policy.mark_slow();
    }

    let nat = classify(&mappings);
    tracing::info!(%nat, timeout, candidates = candidates.len(), "NAT detection finished");
    Ok(NatDetection {
        nat,
        timeout,
        candidates,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loopback::{LoopbackFactory, LoopbackOptions};
    use proptest::prelude::*;

    fn srflx(port: u16, related: u16) -> IceCandidate {
        IceCandidate::new(format!(
            "candidate:2 1 udp 1686052607 203.0.113.7 {port} typ srflx raddr 192.168.1.2 rport {related}"
        ))
    }

    fn host(port: u16) -> IceCandidate {
        IceCandidate::new(format!("candidate:1 1 udp 2122260223 192.168.1.2 {port} typ host"))
    }

    fn mapping(entries: &[(u16, &[u16])]) -> BTreeMap<u16, BTreeSet<u16>> {
        entries
            .iter()
            .map(|(related, ports)| (*related, ports.iter().copied().collect()))
            .collect()
    }

    async fn detect(options: LoopbackOptions) -> (NatDetection, GatheringPolicy, LoopbackFactory) {
        let factory = LoopbackFactory::with_options(options);
        let policy = GatheringPolicy::new();
        let detection = detect_nat(&factory, &RtcConfig::default(), &policy)
            .await
            .unwrap();
        (detection, policy, factory)
    }

    #[test]
    fn test_classify() {
        assert_eq!(classify(&mapping(&[])), NatType::NoNat);
        assert_eq!(classify(&mapping(&[(5000, &[6000])])), NatType::Other);
        assert_eq!(
            classify(&mapping(&[(5000, &[6000, 6001])])),
            NatType::SymmetricNat
        );
        assert_eq!(
            classify(&mapping(&[(5000, &[6000]), (5001, &[6001])])),
            NatType::NoNat
        );
    }

    #[tokio::test]
    async fn test_single_mapping_is_other() {
        let (detection, policy, factory) = detect(LoopbackOptions {
            candidates: vec![host(5000), srflx(6000, 5000)],
            ..Default::default()
        })
        .await;

        assert_eq!(detection.nat, NatType::Other);
        assert!(!detection.timeout);
        assert_eq!(detection.candidates.len(), 2);
        assert!(!policy.slow_ice_detected());
        assert!(factory.transports()[0].is_closed());
    }

    #[tokio::test]
    async fn test_two_mappings_for_one_port_is_symmetric() {
        let (detection, _, _) = detect(LoopbackOptions {
            candidates: vec![host(5000), srflx(6000, 5000), srflx(6001, 5000)],
            ..Default::default()
        })
        .await;
        assert_eq!(detection.nat, NatType::SymmetricNat);
    }

    #[tokio::test]
    async fn test_host_only_is_no_nat() {
        let (detection, _, _) = detect(LoopbackOptions {
            candidates: vec![host(5000)],
            ..Default::default()
        })
        .await;
        assert_eq!(detection.nat, NatType::NoNat);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_gathering_marks_policy() {
        let (detection, policy, factory) = detect(LoopbackOptions {
            candidates: vec![srflx(6000, 5000)],
            complete_gathering: false,
            ..Default::default()
        })
        .await;

        assert!(detection.timeout);
        assert_eq!(detection.nat, NatType::Other);
        assert!(policy.slow_ice_detected());
        assert!(factory.transports()[0].is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_gathering_just_under_threshold_is_not_slow() {
        let (detection, policy, _) = detect(LoopbackOptions {
            candidates: vec![srflx(6000, 5000)],
            gather_delay: Duration::from_millis(2900),
            ..Default::default()
        })
        .await;

        assert!(!detection.timeout);
        assert!(!policy.slow_ice_detected());
    }

    proptest! {
        #[test]
        fn prop_classify_matches_port_counts(
            mappings in prop::collection::btree_map(
                any::<u16>(),
                prop::collection::btree_set(any::<u16>(), 1..4),
                0..4,
            )
        ) {
            let expected = match mappings.len() {
                1 if mappings.values().all(|ports| ports.len() == 1) => NatType::Other,
                1 => NatType::SymmetricNat,
                _ => NatType::NoNat,
            };
            prop_assert_eq!(classify(&mappings), expected);
        }
    }
}
