/*!
Pure pieces of the per-peer state machine: OPEN validation, capability
negotiation, and timer arithmetic. The I/O half lives in
[`crate::session::peer`].
*/
use crate::models::{
    AsnLength, BgpOpen, FsmEvent, NotifErrorCode, OpenErrorSubcode, AS_TRANS,
};
use crate::session::SessionConfig;
use rand::Rng;
use std::time::Duration;

/// Outcome of a successful OPEN exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Negotiated {
    pub hold_time: u16,
    /// Zero when the negotiated hold time is zero: keepalives (and the
    /// hold timer) are suppressed entirely.
    pub keepalive_secs: u64,
    pub asn_len: AsnLength,
    pub peer_asn: u32,
}

/// Why an OPEN was refused, with everything the caller needs to emit the
/// NOTIFICATION and drive the transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenRejection {
    pub code: NotifErrorCode,
    pub subcode: u8,
    pub event: FsmEvent,
    pub reason: String,
}

impl OpenRejection {
    fn new(subcode: OpenErrorSubcode, event: FsmEvent, reason: String) -> OpenRejection {
        OpenRejection {
            code: NotifErrorCode::OpenMessageError,
            subcode: subcode.into(),
            event,
            reason,
        }
    }
}

/// Validate a received OPEN against the session configuration.
///
/// The checks run in sequence: protocol version, AS number (the AS_TRANS
/// sentinel is accepted in the fixed field when the 4-octet capability
/// carries the real AS), hold time floor, BGP identifier, and finally
/// every required capability byte for byte.
pub fn validate_open(config: &SessionConfig, open: &BgpOpen) -> Result<Negotiated, OpenRejection> {
    if open.version != 4 {
        return Err(OpenRejection {
            code: NotifErrorCode::OpenMessageError,
            subcode: OpenErrorSubcode::UnsupportedVersionNumber.into(),
            event: FsmEvent::NotifMsgVerErr,
            reason: format!("peer speaks BGP version {}", open.version),
        });
    }

    let peer_has_as4 = open
        .capabilities
        .iter()
        .any(|c| c.four_octet_asn().is_some());
    let effective_asn = open.effective_asn();
    if config.remote_as != 0 {
        let fixed_field_ok = open.asn == config.remote_as
            || (peer_has_as4 && open.asn == AS_TRANS && effective_asn == config.remote_as);
        if !fixed_field_ok {
            return Err(OpenRejection::new(
                OpenErrorSubcode::BadPeerAs,
                FsmEvent::BgpOpenMsgErr,
                format!(
                    "peer AS {} does not match configured {}",
                    effective_asn, config.remote_as
                ),
            ));
        }
    }

    if open.hold_time != 0 && open.hold_time < config.remote_min_hold_time {
        return Err(OpenRejection::new(
            OpenErrorSubcode::UnacceptableHoldTime,
            FsmEvent::BgpOpenMsgErr,
            format!(
                "hold time {} below the configured minimum {}",
                open.hold_time, config.remote_min_hold_time
            ),
        ));
    }

    if open.bgp_id == 0 || open.bgp_id == config.local_bgp_id {
        return Err(OpenRejection::new(
            OpenErrorSubcode::BadBgpIdentifier,
            FsmEvent::BgpOpenMsgErr,
            format!("unusable peer BGP identifier {:#010x}", open.bgp_id),
        ));
    }

    for requirement in &config.capability_requirements {
        let matched = open.capabilities.iter().any(|c| {
            c.code == requirement.capability.code && c.value == requirement.capability.value
        });
        if !matched && requirement.mandatory {
            return Err(OpenRejection::new(
                OpenErrorSubcode::UnsupportedCapability,
                FsmEvent::UnsupportedCapability,
                format!(
                    "peer is missing required capability {:?}",
                    requirement.capability.code
                ),
            ));
        }
        if !matched {
            log::info!(
                "peer lacks optional capability {:?}",
                requirement.capability.code
            );
        }
    }

    let hold_time = config.local_hold_time.min(open.hold_time);
    let keepalive_secs = if hold_time == 0 {
        0
    } else {
        (hold_time / 3).max(1) as u64
    };
    let asn_len = if peer_has_as4 && config.announces_four_octet_as() {
        AsnLength::Bits32
    } else {
        AsnLength::Bits16
    };

    Ok(Negotiated {
        hold_time,
        keepalive_secs,
        asn_len,
        peer_asn: effective_asn,
    })
}

/// Connect-retry backoff: 75–100% of the nominal interval.
pub fn jitter(nominal: Duration) -> Duration {
    let millis = nominal.as_millis() as u64;
    if millis == 0 {
        return nominal;
    }
    let low = millis * 3 / 4;
    Duration::from_millis(rand::thread_rng().gen_range(low..=millis))
}

/// The OPEN this collector sends for a session.
pub fn local_open(config: &SessionConfig) -> BgpOpen {
    BgpOpen {
        version: 4,
        asn: if config.local_as > u16::MAX as u32 {
            AS_TRANS
        } else {
            config.local_as
        },
        hold_time: config.local_hold_time,
        bgp_id: config.local_bgp_id,
        capabilities: config.announce_capabilities.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::bgp::capabilities::CapabilityRequirement;
    use crate::models::{Afi, BgpCapability, Safi};

    fn config() -> SessionConfig {
        SessionConfig {
            remote_as: 65001,
            local_as: 64512,
            local_bgp_id: 0xC0000201,
            local_hold_time: 180,
            remote_min_hold_time: 3,
            announce_capabilities: vec![BgpCapability::four_octet_as(64512)],
            ..SessionConfig::default()
        }
    }

    fn open() -> BgpOpen {
        BgpOpen {
            version: 4,
            asn: 65001,
            hold_time: 90,
            bgp_id: 0x0A000001,
            capabilities: vec![],
        }
    }

    #[test]
    fn test_accepts_matching_open() {
        let negotiated = validate_open(&config(), &open()).unwrap();
        assert_eq!(negotiated.hold_time, 90);
        assert_eq!(negotiated.keepalive_secs, 30);
        assert_eq!(negotiated.asn_len, AsnLength::Bits16);
        assert_eq!(negotiated.peer_asn, 65001);
    }

    #[test]
    fn test_rejects_wrong_version() {
        let mut bad = open();
        bad.version = 3;
        let rejection = validate_open(&config(), &bad).unwrap_err();
        assert_eq!(rejection.event, FsmEvent::NotifMsgVerErr);
        assert_eq!(
            rejection.subcode,
            u8::from(OpenErrorSubcode::UnsupportedVersionNumber)
        );
    }

    #[test]
    fn test_rejects_wrong_as() {
        let mut bad = open();
        bad.asn = 65002;
        let rejection = validate_open(&config(), &bad).unwrap_err();
        assert_eq!(rejection.subcode, u8::from(OpenErrorSubcode::BadPeerAs));
    }

    #[test]
    fn test_accepts_as_trans_with_capability() {
        let wide_config = SessionConfig {
            remote_as: 196608,
            ..config()
        };
        let wide_open = BgpOpen {
            asn: AS_TRANS,
            capabilities: vec![BgpCapability::four_octet_as(196608)],
            ..open()
        };
        let negotiated = validate_open(&wide_config, &wide_open).unwrap();
        assert_eq!(negotiated.peer_asn, 196608);
        assert_eq!(negotiated.asn_len, AsnLength::Bits32);
    }

    #[test]
    fn test_rejects_low_hold_time() {
        let strict = SessionConfig {
            remote_min_hold_time: 30,
            ..config()
        };
        let mut bad = open();
        bad.hold_time = 10;
        let rejection = validate_open(&strict, &bad).unwrap_err();
        assert_eq!(
            rejection.subcode,
            u8::from(OpenErrorSubcode::UnacceptableHoldTime)
        );
    }

    #[test]
    fn test_zero_hold_time_suppresses_keepalive() {
        let mut zero = open();
        zero.hold_time = 0;
        let negotiated = validate_open(&config(), &zero).unwrap();
        assert_eq!(negotiated.hold_time, 0);
        assert_eq!(negotiated.keepalive_secs, 0);
    }

    #[test]
    fn test_rejects_bad_identifier() {
        let mut zero_id = open();
        zero_id.bgp_id = 0;
        assert!(validate_open(&config(), &zero_id).is_err());

        let mut own_id = open();
        own_id.bgp_id = config().local_bgp_id;
        assert!(validate_open(&config(), &own_id).is_err());
    }

    #[test]
    fn test_required_capability_payload_must_match() {
        let demanding = SessionConfig {
            capability_requirements: vec![CapabilityRequirement {
                capability: BgpCapability::multiprotocol(Afi::Ipv4, Safi::Unicast),
                mandatory: true,
            }],
            ..config()
        };
        let rejection = validate_open(&demanding, &open()).unwrap_err();
        assert_eq!(rejection.event, FsmEvent::UnsupportedCapability);
        assert_eq!(
            rejection.subcode,
            u8::from(OpenErrorSubcode::UnsupportedCapability)
        );

        let satisfying = BgpOpen {
            capabilities: vec![BgpCapability::multiprotocol(Afi::Ipv4, Safi::Unicast)],
            ..open()
        };
        assert!(validate_open(&demanding, &satisfying).is_ok());
    }

    #[test]
    fn test_jitter_stays_in_band() {
        let nominal = Duration::from_secs(120);
        for _ in 0..64 {
            let jittered = jitter(nominal);
            assert!(jittered >= Duration::from_secs(90));
            assert!(jittered <= nominal);
        }
    }
}
