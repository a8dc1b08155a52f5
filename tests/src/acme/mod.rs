//! In-memory ACME CA and DNS zone used by the integration tests.

mod dns_mock;
mod mock_server;

pub use dns_mock::{DnsCall, RecordingDnsProvisioner};
pub use mock_server::{MockAcmeServer, MockStats, MOCK_ACME_BASE};
