//! Register map of the Daikin Altherma 4 (EPSX) Modbus interface.
//!
//! Register numbers are written as in chapter 7.2 of the configuration reference guide, counting
//! from 1.
use super::EdgePolarity::{RisingOnOne, RisingOnZero};
use super::Region::{Coil, Discrete, Holding, Input};
use super::Unit::{Bar, Celsius, Kilowatts, LitresPerMinute, Percent};
use super::{NO_DATA, RegisterSpec, SyntheticBindings};

fn input(address: u32, id: &str, name: &str) -> RegisterSpec {
    RegisterSpec::new(Input, address, id, name).sentinel(NO_DATA)
}

fn temperature(address: u32, id: &str, name: &str, scale: f64) -> RegisterSpec {
    input(address, id, name).signed().scale(scale).unit(Celsius)
}

/// Binary status registers that read 0 while the function is active.
fn running(address: u32, id: &str, name: &str) -> RegisterSpec {
    input(address, id, name).labels(&[(0, "Running"), (1, "Stopped")]).edge(RisingOnZero)
}

fn holding(address: u32, id: &str, name: &str) -> RegisterSpec {
    RegisterSpec::new(Holding, address, id, name).sentinel(NO_DATA)
}

fn discrete(address: u32, id: &str, name: &str) -> RegisterSpec {
    RegisterSpec::new(Discrete, address, id, name)
}

const IDLE_OR_OPERATING: &[(i32, &str)] = &[(0, "Idle/Buffering"), (1, "Operation")];
const OFF_ON: &[(i32, &str)] = &[(0, "Off"), (1, "On")];

pub(super) fn registers() -> Vec<RegisterSpec> {
    vec![
        input(20, "unit_error", "Unit error")
            .labels(&[(0, "No error"), (1, "Warning"), (2, "Error"), (3, "Critical")])
            .edge(RisingOnOne),
        input(21, "unit_error_code", "Unit error code").text(1),
        input(22, "unit_error_sub_code", "Unit error sub code"),
        running(29, "circulation_pump_running", "Circulation pump running"),
        running(30, "compressor_run", "Compressor run"),
        running(31, "booster_heater_run", "Booster heater run"),
        running(32, "disinfection_operation", "Disinfection operation"),
        running(34, "defrost_restart", "Defrost/Restart"),
        running(35, "hot_start", "Hot start"),
        input(36, "three_way_valve", "3-way valve").labels(&[(0, "Space heating"), (1, "DHW")]),
        input(37, "operation_mode", "Operation mode")
            .labels(&[(0, "Off"), (1, "Heating"), (2, "Cooling")]),
        temperature(39, "leaving_water_temperature_phe", "Leaving water temperature PHE", 0.01),
        temperature(40, "leaving_water_temperature_buh", "Leaving water temperature BUH", 0.01),
        temperature(41, "return_water_temperature", "Return water temperature", 0.01),
        temperature(42, "dhw_temperature", "DHW temperature", 0.01),
        temperature(43, "outside_air_temperature", "Outside air temperature", 0.01),
        temperature(44, "liquid_refrigerant_temperature", "Liquid refrigerant temperature", 0.001),
        input(48, "flow_rate", "Flow rate").scale(0.01).unit(LitresPerMinute),
        temperature(
            49,
            "remote_controller_room_temperature",
            "Remote controller room temperature",
            0.001,
        ),
        input(50, "heat_pump_power_consumption", "Heat pump power consumption")
            .scale(0.01)
            .unit(Kilowatts),
        input(51, "dhw_normal_operation", "DHW normal operation").labels(IDLE_OR_OPERATING),
        input(52, "space_normal_operation", "Space heating/cooling normal operation")
            .labels(IDLE_OR_OPERATING),
        temperature(53, "main_heating_setpoint_lower", "Leaving water Main Heating setpoint lower", 0.01),
        temperature(54, "main_heating_setpoint_upper", "Leaving water Main Heating setpoint upper", 0.01),
        temperature(55, "main_cooling_setpoint_lower", "Leaving water Main Cooling setpoint lower", 0.01),
        temperature(56, "main_cooling_setpoint_upper", "Leaving water Main Cooling setpoint upper", 0.01),
        temperature(57, "add_heating_setpoint_lower", "Leaving water Add Heating setpoint lower", 0.001),
        temperature(58, "add_heating_setpoint_upper", "Leaving water Add Heating setpoint upper", 0.001),
        temperature(59, "add_cooling_setpoint_lower", "Leaving water Add Cooling setpoint lower", 0.001),
        temperature(60, "add_cooling_setpoint_upper", "Leaving water Add Cooling setpoint upper", 0.001),
        input(62, "disinfection_state", "Disinfection state").labels(&[
            (0, "Unsuccessful"),
            (1, "Successful"),
            (2, "Maintain"),
            (3, "Heat Up"),
        ]),
        running(63, "holiday_mode", "Holiday mode"),
        input(64, "demand_response_mode", "Demand response mode").labels(&[
            (0, "Free"),
            (1, "Forced Off"),
            (2, "Forced On"),
            (3, "Recommended On"),
            (4, "Reduced"),
        ]),
        input(65, "bypass_valve_position", "Bypass valve position").unit(Percent),
        input(66, "tank_valve_position", "Tank valve position").unit(Percent),
        input(67, "circulation_pump_speed", "Circulation pump speed").unit(LitresPerMinute),
        input(68, "mixed_pump_pwm", "Mixed pump PWM").unit(Percent),
        input(69, "direct_pump_pwm", "Direct pump PWM").unit(Percent),
        input(70, "mixing_valve_position", "Mixing valve position in mixing kit").unit(Percent),
        temperature(71, "mixing_kit_leaving_water_temperature", "Mixing Leaving water temperature in mixing kit", 0.01),
        temperature(72, "mixing_kit_main_zone_target", "Space heating/cooling target for Main zone in mixing kit", 0.01),
        temperature(73, "leaving_water_temperature_pre_phe", "Leaving water temperature prePHE outdoor", 0.01),
        temperature(74, "leaving_water_temperature_tank_valve", "Leaving water temperature Tank valve", 0.01),
        temperature(75, "dhw_upper_temperature", "Domestic Hot Water Upper temperature", 0.01),
        temperature(76, "dhw_lower_temperature", "Domestic Hot Water Lower temperature", 0.01),
        input(78, "water_pressure", "Water pressure").signed().scale(0.01).unit(Bar),
        input(82, "unit_operation_mode", "Unit operation mode").labels(&[
            (0, "Stop"),
            (1, "Tank Heat Up"),
            (2, "Space heating"),
            (3, "Space cooling"),
            (4, "Actuator"),
        ]),
        holding(2, "operation_mode_setting", "Operation mode")
            .labels(&[(0, "Auto"), (1, "Heating"), (2, "Cooling")]),
        holding(3, "space_heating_cooling", "Space heating/cooling").labels(&[(0, "OFF"), (1, "ON")]),
        holding(8, "quiet_mode", "Quiet mode operation")
            .labels(&[(0, "Off"), (1, "On (Automatic)"), (2, "On (Manual)")]),
        holding(9, "dhw_reheat_setpoint", "DHW reheat setpoint")
            .signed()
            .unit(Celsius)
            .limits(30.0, 85.0, 1.0),
        holding(12, "dhw_booster_mode", "DHW booster mode ON/OFF (Powerful)")
            .labels(&[(0, "Off"), (1, "On (Powerful)")]),
        holding(13, "dhw_boost_setpoint", "DHW boost setpoint (Powerful)")
            .signed()
            .scale(0.01)
            .unit(Celsius)
            .limits(30.0, 85.0, 1.0),
        holding(14, "dhw_single_heat_up", "DHW Single heat-up ON/OFF (Manual)").signed().labels(OFF_ON),
        holding(15, "dhw_single_heat_up_setpoint", "DHW Single heat-up setpoint (Manual)")
            .signed()
            .scale(0.01)
            .unit(Celsius)
            .limits(30.0, 85.0, 1.0),
        holding(53, "main_heating_offset", "Weather-dependent mode Main LWT Heating setpoint offset")
            .signed()
            .unit(Celsius)
            .limits(-5.0, 5.0, 1.0),
        holding(57, "imposed_power_limit", "Imposed power limit")
            .scale(0.001)
            .unit(Kilowatts)
            .limits(0.0, 20.0, 0.5),
        holding(65, "add_heating_offset", "Weather-dependent mode Add LWT Heating setpoint offset")
            .signed()
            .unit(Celsius)
            .limits(-10.0, 10.0, 1.0),
        holding(67, "main_heating_weather_dependent", "Weather-dependent mode Heating Main")
            .labels(&[(0, "Fixed"), (1, "Weather dependent")]),
        discrete(1, "status_shut_off_valve", "Shut-off valve"),
        discrete(2, "status_backup_heater_relay_1", "Backup heater relay 1"),
        discrete(3, "status_backup_heater_relay_2", "Backup heater relay 2"),
        discrete(4, "status_backup_heater_relay_3", "Backup heater relay 3"),
        discrete(5, "status_backup_heater_relay_4", "Backup heater relay 4"),
        discrete(6, "status_backup_heater_relay_5", "Backup heater relay 5"),
        discrete(7, "status_backup_heater_relay_6", "Backup heater relay 6"),
        discrete(8, "status_auxiliary_heating", "Auxiliary heating").edge(RisingOnOne),
        discrete(9, "status_storage_tank", "Storage tank"),
        discrete(10, "status_bivalent", "Bivalent"),
        discrete(11, "status_compressor_running", "Compressor running"),
        discrete(12, "status_quiet_mode", "Quiet mode operation active"),
        discrete(13, "status_holiday_mode", "Holiday mode active"),
        discrete(14, "status_antifrost", "Antifrost status"),
        discrete(15, "status_water_pipe_freeze_prevention", "Water pipe freeze prevention status"),
        discrete(16, "status_disinfection_operation", "Disinfection operation"),
        discrete(17, "status_defrost", "Defrost").edge(RisingOnOne),
        discrete(18, "status_hot_start", "Hot start"),
        discrete(19, "status_dhw_running", "DHW running").edge(RisingOnOne),
        discrete(20, "status_main_zone_running", "Main zone running"),
        discrete(21, "status_additional_zone_running", "Additional zone running"),
        discrete(22, "status_powerful_tank_heat_up_request", "Powerful tank heat up request"),
        discrete(23, "status_manual_tank_heat_up_request", "Manual tank heat up request"),
        discrete(24, "status_emergency", "Emergency active"),
        discrete(25, "status_circulation_pump_running", "Circulation pump running"),
        discrete(26, "status_imposed_limit_acceptance", "Imposed limit acceptance"),
        RegisterSpec::new(Coil, 1, "dhw_enabled", "Domestic Hot Water ON/OFF"),
        RegisterSpec::new(Coil, 2, "main_zone_enabled", "Main zone ON/OFF"),
        RegisterSpec::new(Coil, 3, "additional_zone_enabled", "Additional zone ON/OFF"),
    ]
}

pub(super) fn synthetic() -> SyntheticBindings {
    SyntheticBindings {
        flow: Some("flow_rate".into()),
        leaving: Some("leaving_water_temperature_phe".into()),
        return_: Some("return_water_temperature".into()),
        electric_power: Some("heat_pump_power_consumption".into()),
    }
}
