use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use certflow_acme::{DnsChallengeProvisioner, DnsOperation, DnsProvisioningError};

/// One call received by [`RecordingDnsProvisioner`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DnsCall {
    Add {
        zone: String,
        host_prefix: String,
        value: String,
        ttl: u32,
    },
    Delete {
        zone: String,
        host_prefix: String,
    },
}

#[derive(Debug, Default)]
struct DnsState {
    calls: Vec<DnsCall>,
    records: BTreeMap<String, Vec<String>>,
    next_id: u64,
    fail_adds: bool,
    fail_deletes: bool,
}

/// In-memory DNS zone that records every provisioning call.
///
/// Clones share the same zone, so a test can hand one clone to the engine
/// and another to [`super::MockAcmeServer`] for challenge validation.
#[derive(Debug, Clone, Default)]
pub struct RecordingDnsProvisioner {
    state: Arc<Mutex<DnsState>>,
}

impl RecordingDnsProvisioner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rejects every `add_txt_record` call.
    pub fn failing_adds(self) -> Self {
        self.lock().fail_adds = true;
        self
    }

    /// Rejects every `delete_txt_record` call.
    pub fn failing_deletes(self) -> Self {
        self.lock().fail_deletes = true;
        self
    }

    pub fn calls(&self) -> Vec<DnsCall> {
        self.lock().calls.clone()
    }

    pub fn adds(&self) -> Vec<DnsCall> {
        self.calls()
            .into_iter()
            .filter(|call| matches!(call, DnsCall::Add { .. }))
            .collect()
    }

    pub fn deletes(&self) -> Vec<DnsCall> {
        self.calls()
            .into_iter()
            .filter(|call| matches!(call, DnsCall::Delete { .. }))
            .collect()
    }

    /// TXT values currently published at `fqdn`.
    pub fn txt_values(&self, fqdn: &str) -> Vec<String> {
        self.lock().records.get(fqdn).cloned().unwrap_or_default()
    }

    /// Names that still carry at least one TXT value.
    pub fn published_names(&self) -> Vec<String> {
        self.lock().records.keys().cloned().collect()
    }

    fn lock(&self) -> MutexGuard<'_, DnsState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl DnsChallengeProvisioner for RecordingDnsProvisioner {
    fn add_txt_record(
        &self,
        zone: &str,
        host_prefix: &str,
        value: &str,
        ttl: u32,
    ) -> Result<String, DnsProvisioningError> {
        let mut state = self.lock();
        state.calls.push(DnsCall::Add {
            zone: zone.to_owned(),
            host_prefix: host_prefix.to_owned(),
            value: value.to_owned(),
            ttl,
        });
        if state.fail_adds {
            return Err(DnsProvisioningError::new(
                DnsOperation::Add,
                zone,
                host_prefix,
                "zone is read-only",
            ));
        }

        let values = state
            .records
            .entry(format!("{host_prefix}.{zone}"))
            .or_default();
        if !values.iter().any(|existing| existing == value) {
            values.push(value.to_owned());
        }
        state.next_id += 1;
        Ok(format!("record-{}", state.next_id))
    }

    fn delete_txt_record(&self, zone: &str, host_prefix: &str) -> Result<(), DnsProvisioningError> {
        let mut state = self.lock();
        state.calls.push(DnsCall::Delete {
            zone: zone.to_owned(),
            host_prefix: host_prefix.to_owned(),
        });
        if state.fail_deletes {
            return Err(DnsProvisioningError::new(
                DnsOperation::Delete,
                zone,
                host_prefix,
                "zone is read-only",
            ));
        }
        state.records.remove(&format!("{host_prefix}.{zone}"));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn add_and_delete_are_recorded() {
        let dns = RecordingDnsProvisioner::new();
        let id = dns
            .add_txt_record("example.com", "_acme-challenge.www", "value", 60)
            .expect("add");
        assert_eq!(id, "record-1");
        assert_eq!(
            dns.txt_values("_acme-challenge.www.example.com"),
            vec!["value".to_owned()]
        );

        dns.delete_txt_record("example.com", "_acme-challenge.www")
            .expect("delete");
        assert!(dns.published_names().is_empty());
        assert_eq!(dns.adds().len(), 1);
        assert_eq!(
            dns.deletes(),
            vec![DnsCall::Delete {
                zone: "example.com".to_owned(),
                host_prefix: "_acme-challenge.www".to_owned(),
            }]
        );
    }

    #[test]
    fn failing_mode_still_records_the_call() {
        let dns = RecordingDnsProvisioner::new().failing_adds();
        let err = dns
            .add_txt_record("example.com", "_acme-challenge", "value", 60)
            .expect_err("add must fail");
        assert_eq!(err.operation, DnsOperation::Add);
        assert_eq!(dns.calls().len(), 1);
        assert!(dns.published_names().is_empty());
    }
}
