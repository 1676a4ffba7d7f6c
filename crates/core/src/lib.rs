//! Sensing-and-control core of the irrigation controller.
//!
//! Hardware-independent: backends plug in through [`io::AnalogSource`] and
//! [`io::DigitalOutput`], flow sensors feed [`flow::PulseEdge`] handles, and
//! consumers of zone state implement [`telemetry::TelemetrySink`].

pub mod calibration;
pub mod channel;
pub mod flow;
pub mod io;
pub mod scheduler;
pub mod telemetry;
pub mod valve;
pub mod zone;

pub use calibration::CalibrationBounds;
pub use channel::{ChannelReader, MuxBus};
pub use flow::{pulse_counter, FlowRateEstimator, PulseCounter, PulseEdge};
pub use scheduler::{ControlLoop, LoopSettings};
pub use telemetry::{LogSink, TelemetrySink, ZoneSnapshot};
pub use valve::ValveState;
pub use zone::Zone;
