//! Card colour and label for each unit state.

use crate::unit::UnitState;

/// Card background while idle.
pub const IDLE_COLOR: Rgb = Rgb(0xdd, 0xdd, 0xdd);
/// Card background while a pipeline is running.
pub const BUSY_COLOR: Rgb = Rgb(0xe9, 0xc7, 0xff);
/// Card background after a successful run.
pub const OK_COLOR: Rgb = Rgb(0x40, 0xff, 0x40);
/// Card background after a failure.
pub const ERROR_COLOR: Rgb = Rgb(0xff, 0x14, 0x5b);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rgb(pub u8, pub u8, pub u8);

impl Rgb {
    pub fn hex(self) -> String {
        format!("#{:02x}{:02x}{:02x}", self.0, self.1, self.2)
    }
}

/// How a unit card is drawn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CardStyle {
    pub color: Rgb,
    /// Bilingual status text, English first.
    pub label: &'static str,
}

/// Map a state to its card style.
pub fn card_style(state: UnitState) -> CardStyle {
    let (color, label) = match state {
        UnitState::Idle => (IDLE_COLOR, "Idle 闲置中"),
        UnitState::Flashing => (BUSY_COLOR, "Flashing 刷新"),
        UnitState::Connecting => (BUSY_COLOR, "Connecting 连接"),
        UnitState::Connected => (BUSY_COLOR, "Connected 连接成功"),
        UnitState::CheckingPressure => (BUSY_COLOR, "Zero pressure ADC\n零压力ADC"),
        UnitState::Waiting => (BUSY_COLOR, "Waiting 等待"),
        UnitState::ReadingAdc => (BUSY_COLOR, "Reading ADC 读取ADC"),
        UnitState::Writing => (BUSY_COLOR, "Writing 存储"),
        UnitState::CalibrationSuccess => (BUSY_COLOR, "Calibration Successful\n校准成功"),
        UnitState::Success => (OK_COLOR, "DONE 完成"),
        UnitState::FailConnectFlasher => (ERROR_COLOR, "CONNECT FLASHER\n连接USB通信测试板"),
        UnitState::FailFlash | UnitState::FailConnect => (ERROR_COLOR, "REFLASH 重新存储"),
        UnitState::FailPressure => (ERROR_COLOR, "Failed Pressure Sensor\n压力传感器故障"),
        UnitState::FailAdc => (ERROR_COLOR, "Failed ADC Reading\nADC读数错误"),
        UnitState::FailCalibration => (ERROR_COLOR, "Failed Calibration\n校准失败"),
        UnitState::FailBatteryVoltage => (ERROR_COLOR, "Failed Board Voltage\n错误的线路板电压"),
        UnitState::CheckPower => (ERROR_COLOR, "CHECK POWER SUPPLY\n检查电源"),
    };
    CardStyle { color, label }
}

/// Label of the Flash All control.
pub const FLASH_ALL_LABEL: &str = "Flash All 存储所有线路板";

/// Flash All may only be pressed when no unit is mid-pipeline.
pub fn flash_all_enabled<I>(states: I) -> bool
where
    I: IntoIterator<Item = UnitState>,
{
    !states.into_iter().any(UnitState::is_busy)
}
