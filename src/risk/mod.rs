pub mod calibration;
pub mod scorer;
