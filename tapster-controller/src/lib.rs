#![doc = include_str!("../../README.md")]

pub mod arm_driver;
pub mod controller;
pub mod demo_config;
pub mod demo_model;
pub mod motion_executor;
pub mod sensor_gate;
pub mod simulator;
pub mod start_button;
pub mod state_machine;
pub mod waypoints;
