/*!
# Raptor DevKit - bus stubs and test helpers

Shared by the kernel and agent test suites:
- `RecordingBus`: in-process bus that records every publish and can simulate outages
- `TestHarness`: expectations and polling assertions over recorded traffic
*/

pub mod bus_stub;
pub mod test_utils;

pub use bus_stub::{BusFixtures, RecordedMessage, RecordingBus};
pub use test_utils::{wait_until, TestHarness, TestStats};
