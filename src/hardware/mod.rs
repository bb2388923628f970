//! Hardware contracts and simulated devices.
//!
//! The acquisition core only talks to hardware through the narrow contracts in
//! [`capabilities`]: a [`FrameSource`] (camera) that pushes frames into a
//! [`FrameSink`], and a [`SignalSource`] (DAQ) that invokes registered
//! callbacks for trigger edges and analog sample blocks.
//!
//! [`mock`] provides simulated implementations used by the CLI and the tests.

pub mod capabilities;
pub mod mock;

pub use capabilities::{FrameSink, FrameSource, SampleCallback, SignalSource, TriggerCallback};
pub use mock::{SimulatedCamera, SimulatedDaq, SpotPattern, TriggerLine};
