//! Engineering calculators.
//!
//! Pure arithmetic, answered synchronously. Each calculator validates that
//! the inputs its formula needs are present and physically sensible, and
//! echoes the formula it applied alongside the numbers.

use std::f64::consts::PI;

use async_trait::async_trait;
use serde_json::{json, Map, Value};

use crate::error::ToolError;
use crate::plugins::{opt_float, require_str};
use crate::registry::{
    FunctionSpec, Invocation, InvokeContext, ParamSpec, ParamType, Plugin, PluginDescriptor,
};

pub struct CalculatorPlugin;

fn require_positive(args: &Map<String, Value>, name: &str) -> Result<f64, ToolError> {
    match opt_float(args, name)? {
        None => Err(ToolError::invalid_argument(name, "missing required parameter")),
        Some(v) if v > 0.0 && v.is_finite() => Ok(v),
        Some(_) => Err(ToolError::invalid_argument(name, "must be a positive number")),
    }
}

fn require_number(args: &Map<String, Value>, name: &str) -> Result<f64, ToolError> {
    match opt_float(args, name)? {
        None => Err(ToolError::invalid_argument(name, "missing required parameter")),
        Some(v) if v.is_finite() => Ok(v),
        Some(_) => Err(ToolError::invalid_argument(name, "must be finite")),
    }
}

fn electrical(args: &Map<String, Value>) -> Result<Value, ToolError> {
    match require_str(args, "calculation")? {
        "ohms_law" => {
            let voltage = opt_float(args, "voltage")?;
            let current = opt_float(args, "current")?;
            let resistance = opt_float(args, "resistance")?;
            let (v, i, r) = match (voltage, current, resistance) {
                (Some(v), Some(i), None) => {
                    if i == 0.0 {
                        return Err(ToolError::invalid_argument("current", "must be non-zero"));
                    }
                    (v, i, v / i)
                }
                (Some(v), None, Some(r)) => {
                    if r == 0.0 {
                        return Err(ToolError::invalid_argument("resistance", "must be non-zero"));
                    }
                    (v, v / r, r)
                }
                (None, Some(i), Some(r)) => (i * r, i, r),
                _ => {
                    return Err(ToolError::invalid_argument(
                        "calculation",
                        "ohms_law needs exactly two of voltage, current, resistance",
                    ))
                }
            };
            Ok(json!({
                "calculation": "ohms_law",
                "voltage": v,
                "current": i,
                "resistance": r,
                "power": v * i,
                "formula": "V = I * R, P = V * I",
            }))
        }
        "power" => {
            let voltage = opt_float(args, "voltage")?;
            let current = opt_float(args, "current")?;
            let resistance = opt_float(args, "resistance")?;
            let (power, formula) = match (voltage, current, resistance) {
                (Some(v), Some(i), _) => (v * i, "P = V * I"),
                (_, Some(i), Some(r)) => (i * i * r, "P = I^2 * R"),
                (Some(v), _, Some(r)) => {
                    if r == 0.0 {
                        return Err(ToolError::invalid_argument("resistance", "must be non-zero"));
                    }
                    (v * v / r, "P = V^2 / R")
                }
                _ => {
                    return Err(ToolError::invalid_argument(
                        "calculation",
                        "power needs two of voltage, current, resistance",
                    ))
                }
            };
            Ok(json!({ "calculation": "power", "power": power, "formula": formula }))
        }
        "impedance" => {
            let resistance = require_number(args, "resistance")?;
            let frequency = require_positive(args, "frequency")?;
            let inductive = opt_float(args, "inductance")?
                .map(|l| 2.0 * PI * frequency * l)
                .unwrap_or(0.0);
            let capacitive = match opt_float(args, "capacitance")? {
                Some(c) if c > 0.0 => 1.0 / (2.0 * PI * frequency * c),
                Some(_) => {
                    return Err(ToolError::invalid_argument("capacitance", "must be a positive number"))
                }
                None => 0.0,
            };
            let reactance = inductive - capacitive;
            let impedance = (resistance * resistance + reactance * reactance).sqrt();
            Ok(json!({
                "calculation": "impedance",
                "impedance": impedance,
                "inductive_reactance": inductive,
                "capacitive_reactance": capacitive,
                "formula": "Z = sqrt(R^2 + (XL - XC)^2)",
            }))
        }
        "resonance" => {
            let inductance = require_positive(args, "inductance")?;
            let capacitance = require_positive(args, "capacitance")?;
            let frequency = 1.0 / (2.0 * PI * (inductance * capacitance).sqrt());
            Ok(json!({
                "calculation": "resonance",
                "resonant_frequency": frequency,
                "formula": "f = 1 / (2 * pi * sqrt(L * C))",
            }))
        }
        other => Err(ToolError::invalid_argument(
            "calculation",
            format!("unknown electrical calculation '{other}'"),
        )),
    }
}

fn mechanical(args: &Map<String, Value>) -> Result<Value, ToolError> {
    match require_str(args, "calculation")? {
        "stress" => {
            let force = require_number(args, "force")?;
            let area = require_positive(args, "area")?;
            Ok(json!({
                "calculation": "stress",
                "stress": force / area,
                "formula": "sigma = F / A",
            }))
        }
        "strain" => {
            let original = require_positive(args, "original_length")?;
            let change = require_number(args, "change_in_length")?;
            Ok(json!({
                "calculation": "strain",
                "strain": change / original,
                "formula": "epsilon = dL / L",
            }))
        }
        "dynamics" => {
            let mass = require_positive(args, "mass")?;
            let acceleration = require_number(args, "acceleration")?;
            let mut result = json!({
                "calculation": "dynamics",
                "force": mass * acceleration,
                "formula": "F = m * a",
            });
            if let Some(velocity) = opt_float(args, "velocity")? {
                result["momentum"] = json!(mass * velocity);
                result["kinetic_energy"] = json!(0.5 * mass * velocity * velocity);
            }
            Ok(result)
        }
        other => Err(ToolError::invalid_argument(
            "calculation",
            format!("unknown mechanical calculation '{other}'"),
        )),
    }
}

fn structural(args: &Map<String, Value>) -> Result<Value, ToolError> {
    match require_str(args, "calculation")? {
        "beam_analysis" => {
            let load = require_number(args, "load")?;
            let length = require_positive(args, "length")?;
            let modulus = require_positive(args, "elastic_modulus")?;
            let inertia = require_positive(args, "moment_of_inertia")?;
            let deflection = (load * length.powi(3)) / (3.0 * modulus * inertia);
            Ok(json!({
                "calculation": "beam_analysis",
                "max_deflection": deflection,
                "max_moment": load * length,
                "formula": "delta = P * L^3 / (3 * E * I)",
            }))
        }
        "column_buckling" => {
            let length = require_positive(args, "length")?;
            let modulus = require_positive(args, "elastic_modulus")?;
            let inertia = require_positive(args, "moment_of_inertia")?;
            let critical = (PI * PI * modulus * inertia) / (length * length);
            Ok(json!({
                "calculation": "column_buckling",
                "critical_load": critical,
                "formula": "Pcr = pi^2 * E * I / L^2",
            }))
        }
        other => Err(ToolError::invalid_argument(
            "calculation",
            format!("unknown structural calculation '{other}'"),
        )),
    }
}

fn number_param(name: &'static str, description: &'static str) -> ParamSpec {
    ParamSpec::optional(name, ParamType::Number, description)
}

#[async_trait]
impl Plugin for CalculatorPlugin {
    fn descriptor(&self) -> PluginDescriptor {
        PluginDescriptor {
            name: "calculators",
            description: "Electrical, mechanical and structural engineering calculators",
            functions: vec![
                FunctionSpec {
                    name: "electrical_calculator",
                    description: "Ohm's law, power, impedance and resonance calculations",
                    params: vec![
                        ParamSpec::required("calculation", ParamType::String, "Which calculation to run")
                            .with_one_of(vec!["ohms_law", "power", "impedance", "resonance"]),
                        number_param("voltage", "Voltage in volts"),
                        number_param("current", "Current in amperes"),
                        number_param("resistance", "Resistance in ohms"),
                        number_param("frequency", "Frequency in hertz"),
                        number_param("inductance", "Inductance in henries"),
                        number_param("capacitance", "Capacitance in farads"),
                    ],
                },
                FunctionSpec {
                    name: "mechanical_calculator",
                    description: "Stress, strain and dynamics calculations",
                    params: vec![
                        ParamSpec::required("calculation", ParamType::String, "Which calculation to run")
                            .with_one_of(vec!["stress", "strain", "dynamics"]),
                        number_param("force", "Force in newtons"),
                        number_param("area", "Cross-section area in square meters"),
                        number_param("original_length", "Unloaded length in meters"),
                        number_param("change_in_length", "Length change in meters"),
                        number_param("mass", "Mass in kilograms"),
                        number_param("acceleration", "Acceleration in m/s^2"),
                        number_param("velocity", "Velocity in m/s"),
                    ],
                },
                FunctionSpec {
                    name: "structural_calculator",
                    description: "Cantilever beam deflection and Euler column buckling",
                    params: vec![
                        ParamSpec::required("calculation", ParamType::String, "Which calculation to run")
                            .with_one_of(vec!["beam_analysis", "column_buckling"]),
                        number_param("load", "Point load in newtons"),
                        number_param("length", "Member length in meters"),
                        number_param("elastic_modulus", "Elastic modulus in pascals"),
                        number_param("moment_of_inertia", "Second moment of area in m^4"),
                    ],
                },
            ],
        }
    }

    async fn invoke(
        &self,
        _ctx: &InvokeContext,
        function: &str,
        args: Map<String, Value>,
    ) -> Result<Invocation, ToolError> {
        let result = match function {
            "electrical_calculator" => electrical(&args)?,
            "mechanical_calculator" => mechanical(&args)?,
            "structural_calculator" => structural(&args)?,
            other => return Err(ToolError::UnknownFunction(other.to_string())),
        };
        Ok(Invocation::Immediate(result))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(pairs: &[(&str, Value)]) -> Map<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn ohms_law_derives_the_missing_quantity() {
        let result = electrical(&args(&[
            ("calculation", json!("ohms_law")),
            ("voltage", json!(12.0)),
            ("resistance", json!(4.0)),
        ]))
        .unwrap();
        assert_eq!(result["current"], 3.0);
        assert_eq!(result["power"], 36.0);

        let result = electrical(&args(&[
            ("calculation", json!("ohms_law")),
            ("current", json!(2.0)),
            ("resistance", json!(5.0)),
        ]))
        .unwrap();
        assert_eq!(result["voltage"], 10.0);
    }

    #[test]
    fn ohms_law_rejects_underdetermined_input() {
        let err = electrical(&args(&[
            ("calculation", json!("ohms_law")),
            ("voltage", json!(12.0)),
        ]))
        .unwrap_err();
        assert!(matches!(err, ToolError::InvalidArgument { .. }));
    }

    #[test]
    fn division_by_zero_is_named() {
        let err = electrical(&args(&[
            ("calculation", json!("ohms_law")),
            ("voltage", json!(12.0)),
            ("current", json!(0.0)),
        ]))
        .unwrap_err();
        match err {
            ToolError::InvalidArgument { name, .. } => assert_eq!(name, "current"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn resonance_frequency_matches_hand_calculation() {
        let result = electrical(&args(&[
            ("calculation", json!("resonance")),
            ("inductance", json!(1e-3)),
            ("capacitance", json!(1e-6)),
        ]))
        .unwrap();
        let f = result["resonant_frequency"].as_f64().unwrap();
        assert!((f - 5032.9).abs() < 1.0);
    }

    #[test]
    fn stress_and_strain() {
        let result = mechanical(&args(&[
            ("calculation", json!("stress")),
            ("force", json!(1000.0)),
            ("area", json!(0.01)),
        ]))
        .unwrap();
        assert_eq!(result["stress"], 100_000.0);

        let err = mechanical(&args(&[
            ("calculation", json!("stress")),
            ("force", json!(1000.0)),
            ("area", json!(0.0)),
        ]))
        .unwrap_err();
        match err {
            ToolError::InvalidArgument { name, .. } => assert_eq!(name, "area"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn cantilever_deflection_matches_hand_calculation() {
        // 1 kN on a 2 m cantilever, E = 200 GPa, I = 1e-6 m^4.
        let result = structural(&args(&[
            ("calculation", json!("beam_analysis")),
            ("load", json!(1000.0)),
            ("length", json!(2.0)),
            ("elastic_modulus", json!(200e9)),
            ("moment_of_inertia", json!(1e-6)),
        ]))
        .unwrap();
        let deflection = result["max_deflection"].as_f64().unwrap();
        assert!((deflection - 1.3333e-2).abs() < 1e-5);
        assert_eq!(result["max_moment"], 2000.0);
    }

    #[test]
    fn euler_buckling_matches_hand_calculation() {
        let result = structural(&args(&[
            ("calculation", json!("column_buckling")),
            ("length", json!(3.0)),
            ("elastic_modulus", json!(200e9)),
            ("moment_of_inertia", json!(1e-6)),
        ]))
        .unwrap();
        let critical = result["critical_load"].as_f64().unwrap();
        assert!((critical - 219_325.0).abs() / 219_325.0 < 1e-3);
    }
}
