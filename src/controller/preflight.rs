//! Preflight validation of storage class parameters.
//!
//! Runs before any network or process call so that a misconfigured storage
//! class never leaves anything behind on the array.

use std::collections::HashMap;

use tracing::debug;

use crate::domain::keys;
use crate::domain::ports::{AccessMode, VolumeCapability};
use crate::error::{Error, Result};

/// Keys checked one after the other before the initiator pair.
const LEADING_KEYS: [&str; 4] = [
    keys::FS_TYPE,
    keys::POOL,
    keys::TARGET_IQN,
    keys::PORTALS,
];

fn missing(key: &str) -> Error {
    Error::failed_precondition(format!("'{}' is missing from configuration", key))
}

fn require(parameters: &HashMap<String, String>, key: &str) -> Result<()> {
    debug!(key, "Checking storage class parameter");
    if parameters.contains_key(key) {
        Ok(())
    } else {
        Err(missing(key))
    }
}

/// Validate storage class parameters and requested capabilities.
///
/// Fails with `FailedPrecondition` naming the first missing key, in order
/// `fsType`, `pool`, `iqn`, `portals`, one of `initiatorName` /
/// `uniqueInitiatorNameByPvc`, `apiAddress`; then fails if any capability
/// asks for something other than single node writer.
pub fn run_preflight_checks(
    parameters: &HashMap<String, String>,
    capabilities: &[VolumeCapability],
) -> Result<()> {
    for key in LEADING_KEYS {
        require(parameters, key)?;
    }

    if !parameters.contains_key(keys::INITIATOR_NAME)
        && !parameters.contains_key(keys::UNIQUE_INITIATOR_NAME_BY_PVC)
    {
        return Err(Error::failed_precondition(format!(
            "'{}' and '{}' are missing from configuration, one of them is required",
            keys::INITIATOR_NAME,
            keys::UNIQUE_INITIATOR_NAME_BY_PVC
        )));
    }

    require(parameters, keys::API_ADDRESS)?;

    if capabilities
        .iter()
        .any(|c| c.access_mode != AccessMode::SingleNodeWriter)
    {
        return Err(Error::failed_precondition(
            "dothill storage only supports ReadWriteOnce access mode",
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use proptest::prelude::*;

    const ALL_KEYS: [&str; 7] = [
        keys::FS_TYPE,
        keys::POOL,
        keys::TARGET_IQN,
        keys::PORTALS,
        keys::INITIATOR_NAME,
        keys::UNIQUE_INITIATOR_NAME_BY_PVC,
        keys::API_ADDRESS,
    ];

    fn valid_parameters() -> HashMap<String, String> {
        [
            (keys::FS_TYPE, "ext4"),
            (keys::POOL, "A"),
            (keys::TARGET_IQN, "iqn.2015-11.com.hpe:storage.msa2050"),
            (keys::PORTALS, "10.0.0.1,10.0.0.2"),
            (keys::INITIATOR_NAME, "iqn.1993-08.org.debian:01:node"),
            (keys::API_ADDRESS, "https://array.local"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
    }

    fn capability(mode: AccessMode) -> VolumeCapability {
        VolumeCapability {
            access_mode: mode,
            fs_type: None,
            mount_flags: vec![],
        }
    }

    #[test]
    fn test_valid_configuration_passes() {
        let caps = [capability(AccessMode::SingleNodeWriter)];
        assert!(run_preflight_checks(&valid_parameters(), &caps).is_ok());
        assert!(run_preflight_checks(&valid_parameters(), &[]).is_ok());
    }

    #[test]
    fn test_unique_initiator_name_replaces_initiator_name() {
        let mut params = valid_parameters();
        params.remove(keys::INITIATOR_NAME);
        params.insert(keys::UNIQUE_INITIATOR_NAME_BY_PVC.to_string(), "true".to_string());
        assert!(run_preflight_checks(&params, &[]).is_ok());
    }

    #[test]
    fn test_missing_initiator_pair_names_both_keys() {
        let mut params = valid_parameters();
        params.remove(keys::INITIATOR_NAME);

        let err = run_preflight_checks(&params, &[]).unwrap_err();
        let message = err.to_string();
        assert!(message.contains(keys::INITIATOR_NAME));
        assert!(message.contains(keys::UNIQUE_INITIATOR_NAME_BY_PVC));
    }

    #[test]
    fn test_first_missing_key_is_reported() {
        let mut params = valid_parameters();
        params.remove(keys::POOL);
        params.remove(keys::API_ADDRESS);

        assert_matches!(
            run_preflight_checks(&params, &[]),
            Err(Error::FailedPrecondition(msg)) if msg == "'pool' is missing from configuration"
        );
    }

    #[test]
    fn test_key_presence_checked_before_access_mode() {
        let mut params = valid_parameters();
        params.remove(keys::FS_TYPE);
        let caps = [capability(AccessMode::MultiNodeMultiWriter)];

        assert_matches!(
            run_preflight_checks(&params, &caps),
            Err(Error::FailedPrecondition(msg)) if msg.contains("fsType")
        );
    }

    fn access_mode() -> impl Strategy<Value = AccessMode> {
        prop_oneof![
            Just(AccessMode::Unknown),
            Just(AccessMode::SingleNodeWriter),
            Just(AccessMode::SingleNodeReaderOnly),
            Just(AccessMode::MultiNodeReaderOnly),
            Just(AccessMode::MultiNodeSingleWriter),
            Just(AccessMode::MultiNodeMultiWriter),
        ]
    }

    proptest! {
        #[test]
        fn prop_missing_key_is_named(removed in proptest::sample::subsequence(ALL_KEYS.to_vec(), 1..ALL_KEYS.len())) {
            let mut params = valid_parameters();
            params.insert(keys::UNIQUE_INITIATOR_NAME_BY_PVC.to_string(), "true".to_string());
            for key in &removed {
                params.remove(*key);
            }

            let initiator_pair_gone = removed.contains(&keys::INITIATOR_NAME)
                && removed.contains(&keys::UNIQUE_INITIATOR_NAME_BY_PVC);
            let expected = ALL_KEYS
                .iter()
                .find(|k| {
                    removed.contains(*k)
                        && **k != keys::INITIATOR_NAME
                        && **k != keys::UNIQUE_INITIATOR_NAME_BY_PVC
                })
                .copied();

            let result = run_preflight_checks(&params, &[]);
            let leading_missing = expected.filter(|k| *k != keys::API_ADDRESS);

            match (leading_missing, initiator_pair_gone, expected) {
                (Some(key), _, _) => {
                    let err = result.unwrap_err();
                    prop_assert!(matches!(err, Error::FailedPrecondition(_)));
                    prop_assert!(err.to_string().contains(key));
                }
                (None, true, _) => {
                    let err = result.unwrap_err();
                    prop_assert!(err.to_string().contains(keys::INITIATOR_NAME));
                }
                (None, false, Some(key)) => {
                    let err = result.unwrap_err();
                    prop_assert!(err.to_string().contains(key));
                }
                (None, false, None) => prop_assert!(result.is_ok()),
            }
        }

        #[test]
        fn prop_only_single_node_writer_is_accepted(modes in proptest::collection::vec(access_mode(), 1..5)) {
            let caps: Vec<_> = modes.iter().copied().map(capability).collect();
            let result = run_preflight_checks(&valid_parameters(), &caps);

            if modes.iter().all(|m| *m == AccessMode::SingleNodeWriter) {
                prop_assert!(result.is_ok());
            } else {
                prop_assert!(matches!(result, Err(Error::FailedPrecondition(_))));
            }
        }
    }
}
