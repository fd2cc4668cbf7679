//! This crate provides the control core of a multi-channel programmable bench power supply.
//!
//! It supports `no-std` environments by use of the `no_std` feature flag.
//!
//! What lives here:
//! * Per channel setpoints, limits, monitored values and power balancing
//! * OVP, OCP, OPP and OTP protection with delayed trips
//! * Calibration of the DAC and ADC codes from three measured points
//! * Output sequencing with down-programmer and low ripple mode
//! * Coupling of channel 1 and 2 in series, parallel or tracked mode
//!
//! The converters, the IO expander and the coupling relays are reached through the traits in
//! [`hal`], so the core runs unchanged against real drivers or test doubles. Time is passed in
//! by the caller with [`psu::Psu::tick`].
//!
//! Supported channel boards:
//! * r3B4 (40V / 5A / 155W)
//! * r5B12 (40V / 5A / 155W, with a 500mA low current range)

#![cfg_attr(feature = "no_std", no_std)]

pub mod board;
pub mod calibration;
pub mod channel;
pub mod coupling;
pub mod dispatcher;
pub mod error;
pub mod event;
pub mod hal;
pub mod history;
pub mod ontime;
pub mod protection;
pub mod psu;
pub mod registers;
pub mod types;
pub mod value;

#[cfg(test)]
mod mock_hw;
