// Copyright 2025 The Fluxion Authors. All rights reserved.
// Use of this source code is governed by the Apache License,
// Version 2.0, that can be found in the LICENSE file.

use std::collections::HashMap;
use std::io::{self, Write};

use crate::common::Ident;
use crate::datamodel::{Dt, SimMethod, SimSpecs};

#[derive(PartialEq, Eq, Hash, Copy, Clone, Debug)]
pub enum Method {
    Euler,
    RungeKutta4,
}

/// Simulation specs with the UI conveniences resolved: dt and save_step
/// as plain numbers, the method as something we can dispatch on.
#[derive(Clone, Debug)]
pub struct Specs {
    pub start: f64,
    pub stop: f64,
    pub dt: f64,
    pub save_step: f64,
    pub method: Method,
}

impl Specs {
    pub fn from(specs: &SimSpecs) -> Self {
        let dt: f64 = match &specs.dt {
            Dt::Dt(value) => *value,
            Dt::Reciprocal(value) => 1.0 / *value,
        };

        let save_step: f64 = match &specs.save_step {
            None => dt,
            Some(Dt::Dt(value)) => *value,
            Some(Dt::Reciprocal(value)) => 1.0 / *value,
        };

        let method = match specs.sim_method {
            SimMethod::Euler => Method::Euler,
            SimMethod::RungeKutta4 => Method::RungeKutta4,
        };

        Specs {
            start: specs.start,
            stop: specs.stop,
            dt,
            save_step,
            method,
        }
    }
}

/// A finished simulation's time series: one row per saved step, one
/// column per scalar slot, in a single allocation.
#[derive(Clone, Debug)]
pub struct Results {
    pub offsets: HashMap<Ident, usize>,
    // one large allocation
    pub data: Box<[f64]>,
    pub step_size: usize,
    pub step_count: usize,
    pub specs: Specs,
}

impl Results {
    pub fn iter(&self) -> std::iter::Take<std::slice::Chunks<'_, f64>> {
        self.data.chunks(self.step_size).take(self.step_count)
    }

    /// The time series for a single named variable (or array element).
    pub fn series(&self, ident: &str) -> Option<Vec<(f64, f64)>> {
        let off = *self.offsets.get(ident)?;
        Some(
            self.iter()
                .map(|row| (row[super::compiler::TIME_OFF], row[off]))
                .collect(),
        )
    }

    /// The last saved value of a variable.
    pub fn last(&self, ident: &str) -> Option<f64> {
        let off = *self.offsets.get(ident)?;
        self.iter().last().map(|row| row[off])
    }

    fn ordered_columns(&self) -> Vec<&str> {
        let offset_name_map: HashMap<usize, &str> = self
            .offsets
            .iter()
            .map(|(k, v)| (*v, k.as_str()))
            .collect();
        (0..self.step_size)
            .map(|i| offset_name_map.get(&i).copied().unwrap_or("UNKNOWN"))
            .collect()
    }

    pub fn write_tsv<W: Write>(&self, w: &mut W) -> io::Result<()> {
        self.write_delimited(w, '\t')
    }

    pub fn write_csv<W: Write>(&self, w: &mut W) -> io::Result<()> {
        self.write_delimited(w, ',')
    }

    fn write_delimited<W: Write>(&self, w: &mut W, sep: char) -> io::Result<()> {
        let var_names = self.ordered_columns();

        for (i, id) in var_names.iter().enumerate() {
            if i > 0 {
                write!(w, "{}", sep)?;
            }
            write!(w, "{}", id)?;
        }
        writeln!(w)?;

        for row in self.iter() {
            if row[super::compiler::TIME_OFF] > self.specs.stop {
                break;
            }
            for (i, val) in row.iter().enumerate() {
                if i > 0 {
                    write!(w, "{}", sep)?;
                }
                write!(w, "{}", val)?;
            }
            writeln!(w)?;
        }

        Ok(())
    }

    pub fn print_tsv(&self) {
        let stdout = io::stdout();
        let mut stdout = stdout.lock();
        let _ = self.write_tsv(&mut stdout);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_specs_from() {
        let specs = Specs::from(&SimSpecs {
            start: 0.0,
            stop: 10.0,
            dt: Dt::Reciprocal(4.0),
            save_step: Some(Dt::Dt(1.0)),
            sim_method: SimMethod::RungeKutta4,
            time_units: None,
        });
        assert_eq!(0.25, specs.dt);
        assert_eq!(1.0, specs.save_step);
        assert_eq!(Method::RungeKutta4, specs.method);
    }

    #[test]
    fn test_results_accessors() {
        let offsets: HashMap<Ident, usize> =
            [("time".to_string(), 0), ("x".to_string(), 1)]
                .into_iter()
                .collect();
        let results = Results {
            offsets,
            data: vec![0.0, 5.0, 1.0, 6.0, 2.0, 7.0].into_boxed_slice(),
            step_size: 2,
            step_count: 3,
            specs: Specs {
                start: 0.0,
                stop: 2.0,
                dt: 1.0,
                save_step: 1.0,
                method: Method::Euler,
            },
        };

        assert_eq!(Some(7.0), results.last("x"));
        assert_eq!(
            Some(vec![(0.0, 5.0), (1.0, 6.0), (2.0, 7.0)]),
            results.series("x")
        );
        assert_eq!(None, results.last("missing"));

        let mut out: Vec<u8> = vec![];
        results.write_tsv(&mut out).unwrap();
        let out = String::from_utf8(out).unwrap();
        assert!(out.starts_with("time\tx\n"));
        assert_eq!(4, out.lines().count());
    }
}
