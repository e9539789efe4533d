pub mod ascii;
pub mod modbus;
pub mod transport;
