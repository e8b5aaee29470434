// Copyright 2025 The Fluxion Authors. All rights reserved.
// Use of this source code is governed by the Apache License,
// Version 2.0, that can be found in the LICENSE file.

//! The bytecode virtual machine.
//!
//! Two stacks: numeric values and (static) array views.  All temporaries
//! live in a preallocated scratch region; nothing allocates inside a
//! step.  Arithmetic is IEEE-754: NaN propagates, division by zero
//! yields infinities, booleans are 0/1 with nonzero-truthy inputs.

use std::collections::HashMap;
use std::rc::Rc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use smallvec::SmallVec;

use crate::ast::array_view::ViewSource;
use crate::bytecode::{
    BuiltinId, ByteCode, ByteCodeContext, CompiledModule, ModuleId, Op2, Opcode,
};
use crate::common::{Ident, Result};
use crate::compiler::{
    StepPart, StockSlot, DT_OFF, FINAL_TIME_OFF, INITIAL_TIME_OFF, TIME_OFF,
};
use crate::datamodel::GraphicalFunctionKind;
use crate::results::{Method, Results, Specs};
use crate::sim_err;

pub const DEFAULT_SEED: u64 = 0;

#[inline(always)]
pub(crate) fn is_truthy(n: f64) -> bool {
    n != 0.0
}

/// The output of compilation: deeply immutable, shareable across
/// concurrently running simulations.
#[derive(Clone, Debug)]
pub struct CompiledSimulation {
    pub(crate) modules: HashMap<Ident, CompiledModule>,
    pub(crate) specs: Specs,
    pub(crate) root: Ident,
    pub(crate) offsets: HashMap<Ident, usize>,
    pub(crate) stocks: Vec<StockSlot>,
}

#[derive(Clone, Debug)]
struct CompiledModuleSlice {
    context: Rc<ByteCodeContext>,
    bytecode: Rc<ByteCode>,
    part: StepPart,
}

impl CompiledModuleSlice {
    fn new(module: &CompiledModule, part: StepPart) -> Self {
        CompiledModuleSlice {
            context: module.context.clone(),
            bytecode: match part {
                StepPart::Initials => module.compiled_initials.clone(),
                StepPart::Flows => module.compiled_flows.clone(),
                StepPart::Stocks => module.compiled_stocks.clone(),
            },
            part,
        }
    }
}

#[derive(Clone, Debug)]
struct CompiledSlicedSimulation {
    initial_modules: HashMap<Ident, CompiledModuleSlice>,
    flow_modules: HashMap<Ident, CompiledModuleSlice>,
    stock_modules: HashMap<Ident, CompiledModuleSlice>,
}

#[derive(Debug)]
struct Stack {
    stack: Vec<f64>,
}

impl Stack {
    fn new() -> Self {
        Stack {
            stack: Vec::with_capacity(32),
        }
    }

    #[inline(always)]
    fn push(&mut self, value: f64) {
        self.stack.push(value)
    }

    #[inline(always)]
    fn pop(&mut self) -> f64 {
        self.stack.pop().unwrap()
    }

    #[inline(always)]
    fn is_empty(&self) -> bool {
        self.stack.is_empty()
    }
}

pub struct Vm {
    specs: Specs,
    root: Ident,
    offsets: HashMap<Ident, usize>,
    sliced_sim: CompiledSlicedSimulation,
    stocks: Vec<StockSlot>,
    n_slots: usize,
    n_chunks: usize,
    temp_size: usize,
    rng: StdRng,
    data: Option<Box<[f64]>>,
}

impl Vm {
    pub fn new(sim: CompiledSimulation) -> Result<Vm> {
        Vm::new_with_seed(sim, DEFAULT_SEED)
    }

    pub fn new_with_seed(sim: CompiledSimulation, seed: u64) -> Result<Vm> {
        if sim.specs.stop < sim.specs.start {
            return sim_err!(
                BadSimSpecs,
                "end time has to be after start time".to_string()
            );
        }
        if sim.specs.dt <= 0.0 {
            return sim_err!(BadSimSpecs, "dt must be greater than 0".to_string());
        }

        let save_step = if sim.specs.save_step > sim.specs.dt {
            sim.specs.save_step
        } else {
            sim.specs.dt
        };
        let n_slots = sim.modules[&sim.root].n_slots;
        let n_chunks: usize = ((sim.specs.stop - sim.specs.start) / save_step + 1.0) as usize;
        let temp_size = sim
            .modules
            .values()
            .map(|m| m.context.temp_size)
            .max()
            .unwrap_or(0);
        let data: Box<[f64]> = vec![0.0; n_slots * n_chunks].into_boxed_slice();
        Ok(Vm {
            specs: sim.specs.clone(),
            root: sim.root.clone(),
            offsets: sim.offsets.clone(),
            sliced_sim: CompiledSlicedSimulation {
                initial_modules: sim
                    .modules
                    .iter()
                    .map(|(id, m)| (id.clone(), CompiledModuleSlice::new(m, StepPart::Initials)))
                    .collect(),
                flow_modules: sim
                    .modules
                    .iter()
                    .map(|(id, m)| (id.clone(), CompiledModuleSlice::new(m, StepPart::Flows)))
                    .collect(),
                stock_modules: sim
                    .modules
                    .iter()
                    .map(|(id, m)| (id.clone(), CompiledModuleSlice::new(m, StepPart::Stocks)))
                    .collect(),
            },
            stocks: sim.stocks,
            n_slots,
            n_chunks,
            temp_size,
            rng: StdRng::seed_from_u64(seed),
            data: Some(data),
        })
    }

    pub fn run_to_end(&mut self) -> Result<()> {
        self.run_to_end_with(None)
    }

    pub fn run_to_end_with(&mut self, cancel: Option<&dyn Fn() -> bool>) -> Result<()> {
        let spec = self.specs.clone();
        let end = spec.stop;

        let save_every = std::cmp::max(1, (spec.save_step / spec.dt + 0.5).floor() as usize);
        let dt = spec.dt;

        let stock_elems: Vec<(usize, bool)> = self
            .stocks
            .iter()
            .flat_map(|slot| (0..slot.size).map(move |i| (slot.off + i, slot.non_negative)))
            .collect();

        let mut temp = vec![0.0; self.temp_size];
        let mut rk_state = vec![0.0; self.n_slots];
        let mut rk_next = vec![0.0; self.n_slots];
        let mut k1 = vec![0.0; stock_elems.len()];
        let mut k2 = vec![0.0; stock_elems.len()];
        let mut k3 = vec![0.0; stock_elems.len()];
        let mut k4 = vec![0.0; stock_elems.len()];

        let mut data = None;
        std::mem::swap(&mut data, &mut self.data);
        let mut data = data.unwrap();
        let mut cancelled = false;

        {
            let module_initials = self.sliced_sim.initial_modules[&self.root].clone();
            let module_flows = self.sliced_sim.flow_modules[&self.root].clone();
            let module_stocks = self.sliced_sim.stock_modules[&self.root].clone();

            let mut stack = Stack::new();
            let module_inputs: &[f64] = &[0.0; 0];
            let n_slots = self.n_slots;
            let n_chunks = self.n_chunks;

            // the simulation runs in a pair of working rows; rows on the
            // save grid are snapshotted into the results slab after
            // flows are evaluated, so every saved row is consistent
            let mut curr = vec![0.0; n_slots];
            let mut next = vec![0.0; n_slots];
            curr[TIME_OFF] = spec.start;
            curr[DT_OFF] = dt;
            curr[INITIAL_TIME_OFF] = spec.start;
            curr[FINAL_TIME_OFF] = spec.stop;
            self.eval(
                &module_initials,
                0,
                module_inputs,
                &mut curr,
                &mut next,
                &mut temp,
                &mut stack,
            );

            let mut saved = 0_usize;
            let mut step = 0_usize;
            loop {
                self.eval(
                    &module_flows,
                    0,
                    module_inputs,
                    &mut curr,
                    &mut next,
                    &mut temp,
                    &mut stack,
                );

                if step == 0 {
                    let row = &mut data[saved * n_slots..(saved + 1) * n_slots];
                    row.copy_from_slice(&curr);
                    saved += 1;
                    if saved >= n_chunks {
                        break;
                    }
                }

                self.eval(
                    &module_stocks,
                    0,
                    module_inputs,
                    &mut curr,
                    &mut next,
                    &mut temp,
                    &mut stack,
                );

                match spec.method {
                    Method::Euler => {
                        for &(off, non_negative) in stock_elems.iter() {
                            let mut value = curr[off] + dt * next[off];
                            if non_negative && value < 0.0 {
                                value = 0.0;
                            }
                            next[off] = value;
                        }
                    }
                    Method::RungeKutta4 => {
                        for (i, &(off, _)) in stock_elems.iter().enumerate() {
                            k1[i] = next[off];
                        }
                        for sample in 0..3 {
                            let (sample_dt, ks) = match sample {
                                0 => (dt / 2.0, k1.clone()),
                                1 => (dt / 2.0, k2.clone()),
                                _ => (dt, k3.clone()),
                            };
                            rk_state.copy_from_slice(&curr);
                            for (i, &(off, _)) in stock_elems.iter().enumerate() {
                                rk_state[off] = curr[off] + sample_dt * ks[i];
                            }
                            rk_state[TIME_OFF] = curr[TIME_OFF] + sample_dt;
                            self.eval(
                                &module_flows,
                                0,
                                module_inputs,
                                &mut rk_state,
                                &mut rk_next,
                                &mut temp,
                                &mut stack,
                            );
                            self.eval(
                                &module_stocks,
                                0,
                                module_inputs,
                                &mut rk_state,
                                &mut rk_next,
                                &mut temp,
                                &mut stack,
                            );
                            let kd = match sample {
                                0 => &mut k2,
                                1 => &mut k3,
                                _ => &mut k4,
                            };
                            for (i, &(off, _)) in stock_elems.iter().enumerate() {
                                kd[i] = rk_next[off];
                            }
                        }
                        for (i, &(off, non_negative)) in stock_elems.iter().enumerate() {
                            let slope = (k1[i] + 2.0 * k2[i] + 2.0 * k3[i] + k4[i]) / 6.0;
                            let mut value = curr[off] + dt * slope;
                            if non_negative && value < 0.0 {
                                value = 0.0;
                            }
                            next[off] = value;
                        }
                    }
                }

                next[TIME_OFF] = curr[TIME_OFF] + dt;
                next[DT_OFF] = dt;
                next[INITIAL_TIME_OFF] = spec.start;
                next[FINAL_TIME_OFF] = spec.stop;

                if let Some(cancel) = cancel {
                    if cancel() {
                        cancelled = true;
                        break;
                    }
                }

                // non-stock slots of next are stale, but the flows pass
                // at the top of the loop rewrites all of them
                std::mem::swap(&mut curr, &mut next);
                step = (step + 1) % save_every;
            }

            // stock and flow values cover every saved step through the
            // end time
            debug_assert!(cancelled || curr[TIME_OFF] >= end - dt * 1e-6);
        }

        let mut data = Some(data);
        std::mem::swap(&mut data, &mut self.data);

        if cancelled {
            return sim_err!(Generic, "simulation cancelled".to_string());
        }

        Ok(())
    }

    pub fn into_results(self) -> Results {
        Results {
            offsets: self.offsets.clone(),
            data: self.data.unwrap(),
            step_size: self.n_slots,
            step_count: self.n_chunks,
            specs: self.specs,
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn eval_module(
        &mut self,
        parent_module: &CompiledModuleSlice,
        parent_module_off: usize,
        module_inputs: &[f64],
        curr: &mut [f64],
        next: &mut [f64],
        temp: &mut [f64],
        stack: &mut Stack,
        id: ModuleId,
    ) {
        let module_decl = &parent_module.context.modules[id as usize];
        let module_key = module_decl.model_name.as_str();
        let module = match parent_module.part {
            StepPart::Initials => self.sliced_sim.initial_modules[module_key].clone(),
            StepPart::Flows => self.sliced_sim.flow_modules[module_key].clone(),
            StepPart::Stocks => self.sliced_sim.stock_modules[module_key].clone(),
        };

        let module_off = parent_module_off + module_decl.off;
        self.eval(&module, module_off, module_inputs, curr, next, temp, stack);
    }

    #[allow(clippy::too_many_arguments)]
    fn eval(
        &mut self,
        module: &CompiledModuleSlice,
        module_off: usize,
        module_inputs: &[f64],
        curr: &mut [f64],
        next: &mut [f64],
        temp: &mut [f64],
        stack: &mut Stack,
    ) {
        let bytecode = &module.bytecode;

        let mut condition = false;
        let mut subscript_index: SmallVec<[(usize, usize); 4]> = SmallVec::new();
        let mut subscript_index_valid = true;
        // views never outlive a single runlist entry, so the view stack
        // is local to this frame
        let mut view_stack: SmallVec<[u16; 4]> = SmallVec::new();

        let read_view_elem = |view_id: u16, elem_off: usize, curr: &[f64], temp: &[f64]| -> f64 {
            let compiled = &module.context.views[view_id as usize];
            match compiled.view.source {
                ViewSource::State => curr[module_off + compiled.base + elem_off],
                ViewSource::Temp => temp[elem_off],
            }
        };

        let code = &bytecode.code;
        for op in code.iter() {
            match *op {
                Opcode::Op2 { op } => {
                    let r = stack.pop();
                    let l = stack.pop();
                    let result = match op {
                        Op2::Add => l + r,
                        Op2::Sub => l - r,
                        Op2::Exp => l.powf(r),
                        Op2::Mul => l * r,
                        Op2::Div => l / r,
                        Op2::Mod => l.rem_euclid(r),
                        Op2::Gt => (l > r) as i8 as f64,
                        Op2::Gte => (l >= r) as i8 as f64,
                        Op2::Lt => (l < r) as i8 as f64,
                        Op2::Lte => (l <= r) as i8 as f64,
                        Op2::Eq => (l == r) as i8 as f64,
                        Op2::And => (is_truthy(l) && is_truthy(r)) as i8 as f64,
                        Op2::Or => (is_truthy(l) || is_truthy(r)) as i8 as f64,
                    };
                    stack.push(result);
                }
                Opcode::Not {} => {
                    let r = stack.pop();
                    stack.push((!is_truthy(r)) as i8 as f64);
                }
                Opcode::LoadConstant { id } => {
                    stack.push(bytecode.literals[id as usize]);
                }
                Opcode::LoadGlobalVar { off } => {
                    stack.push(curr[off as usize]);
                }
                Opcode::LoadVar { off } => {
                    stack.push(curr[module_off + off as usize]);
                }
                Opcode::LoadTemp { off } => {
                    stack.push(temp[off as usize]);
                }
                Opcode::StoreTemp { off } => {
                    temp[off as usize] = stack.pop();
                }
                Opcode::PushSubscriptIndex { bounds } => {
                    let index = stack.pop().floor() as i64;
                    if index < 1 || index > bounds as i64 {
                        subscript_index_valid = false;
                    } else {
                        // 1-based at the surface, 0-based here
                        subscript_index.push(((index - 1) as usize, bounds as usize));
                    };
                }
                Opcode::LoadSubscript { off } => {
                    // indices were pushed innermost-axis first; fold them
                    // back in row-major axis order
                    let result = if subscript_index_valid {
                        let mut index = 0;
                        for (i, bounds) in subscript_index.iter().rev() {
                            index *= *bounds;
                            index += *i;
                        }
                        curr[module_off + off as usize + index]
                    } else {
                        f64::NAN
                    };
                    stack.push(result);
                    subscript_index.clear();
                    subscript_index_valid = true;
                }
                Opcode::SetCond {} => {
                    condition = is_truthy(stack.pop());
                }
                Opcode::If {} => {
                    let f = stack.pop();
                    let t = stack.pop();
                    let result = if condition { t } else { f };
                    stack.push(result);
                }
                Opcode::LoadModuleInput { input } => {
                    stack.push(module_inputs[input as usize]);
                }
                Opcode::EvalModule { id, n_inputs } => {
                    let mut module_inputs: SmallVec<[f64; 16]> =
                        std::iter::repeat(0.0).take(n_inputs as usize).collect();
                    for j in (0..(n_inputs as usize)).rev() {
                        module_inputs[j] = stack.pop();
                    }
                    self.eval_module(
                        module,
                        module_off,
                        &module_inputs,
                        curr,
                        next,
                        temp,
                        stack,
                        id,
                    );
                }
                Opcode::AssignCurr { off } => {
                    curr[module_off + off as usize] = stack.pop();
                    debug_assert!(stack.is_empty());
                }
                Opcode::AssignNext { off } => {
                    next[module_off + off as usize] = stack.pop();
                    debug_assert!(stack.is_empty());
                }
                Opcode::Apply { func } => {
                    let time = curr[TIME_OFF];
                    let dt = curr[DT_OFF];
                    let c = stack.pop();
                    let b = stack.pop();
                    let a = stack.pop();

                    stack.push(apply(func, time, dt, a, b, c, &mut self.rng));
                }
                Opcode::Lookup { gf } => {
                    let index = stack.pop();
                    let gf = &module.context.graphical_functions[gf as usize];
                    stack.push(lookup(&gf.data, gf.kind, index));
                }
                Opcode::PushView { id } => {
                    view_stack.push(id);
                }
                Opcode::ArraySum {} => {
                    let view_id = view_stack.pop().unwrap();
                    let compiled = &module.context.views[view_id as usize];
                    let mut acc = 0.0;
                    for elem_off in compiled.view.iter_offsets() {
                        acc += read_view_elem(view_id, elem_off, curr, temp);
                    }
                    stack.push(acc);
                }
                Opcode::ArrayMin {} => {
                    let view_id = view_stack.pop().unwrap();
                    let compiled = &module.context.views[view_id as usize];
                    let mut acc = f64::INFINITY;
                    for elem_off in compiled.view.iter_offsets() {
                        acc = acc.min(read_view_elem(view_id, elem_off, curr, temp));
                    }
                    stack.push(acc);
                }
                Opcode::ArrayMax {} => {
                    let view_id = view_stack.pop().unwrap();
                    let compiled = &module.context.views[view_id as usize];
                    let mut acc = f64::NEG_INFINITY;
                    for elem_off in compiled.view.iter_offsets() {
                        acc = acc.max(read_view_elem(view_id, elem_off, curr, temp));
                    }
                    stack.push(acc);
                }
                Opcode::ArrayMean {} => {
                    let view_id = view_stack.pop().unwrap();
                    let compiled = &module.context.views[view_id as usize];
                    let n = compiled.view.size() as f64;
                    let mut acc = 0.0;
                    for elem_off in compiled.view.iter_offsets() {
                        acc += read_view_elem(view_id, elem_off, curr, temp);
                    }
                    stack.push(if n == 0.0 { f64::NAN } else { acc / n });
                }
                Opcode::ArrayStddev {} => {
                    let view_id = view_stack.pop().unwrap();
                    let compiled = &module.context.views[view_id as usize];
                    let n = compiled.view.size() as f64;
                    if n < 2.0 {
                        stack.push(0.0);
                    } else {
                        let mut sum = 0.0;
                        for elem_off in compiled.view.iter_offsets() {
                            sum += read_view_elem(view_id, elem_off, curr, temp);
                        }
                        let mean = sum / n;
                        let mut sum_sq = 0.0;
                        for elem_off in compiled.view.iter_offsets() {
                            let v = read_view_elem(view_id, elem_off, curr, temp);
                            sum_sq += (v - mean) * (v - mean);
                        }
                        stack.push((sum_sq / (n - 1.0)).sqrt());
                    }
                }
                Opcode::ArraySize {} => {
                    let view_id = view_stack.pop().unwrap();
                    let compiled = &module.context.views[view_id as usize];
                    stack.push(compiled.view.size() as f64);
                }
                Opcode::Ret => {
                    break;
                }
            }
        }
    }
}

#[inline(always)]
fn apply(func: BuiltinId, time: f64, dt: f64, a: f64, b: f64, c: f64, rng: &mut StdRng) -> f64 {
    match func {
        BuiltinId::Abs => a.abs(),
        BuiltinId::Arccos => a.acos(),
        BuiltinId::Arcsin => a.asin(),
        BuiltinId::Arctan => a.atan(),
        BuiltinId::Cos => a.cos(),
        BuiltinId::Exp => a.exp(),
        BuiltinId::Inf => f64::INFINITY,
        BuiltinId::Int => a.floor(),
        BuiltinId::Ln => a.ln(),
        BuiltinId::Log10 => a.log10(),
        BuiltinId::Max => {
            if a > b {
                a
            } else {
                b
            }
        }
        BuiltinId::Min => {
            if a < b {
                a
            } else {
                b
            }
        }
        BuiltinId::Pi => std::f64::consts::PI,
        BuiltinId::Pulse => pulse(time, dt, a, b, c),
        BuiltinId::Ramp => ramp(time, a, b, Some(c)),
        BuiltinId::Rand => {
            let r: f64 = rng.gen();
            a + r * (b - a)
        }
        BuiltinId::SafeDiv => {
            if b != 0.0 {
                a / b
            } else {
                c
            }
        }
        BuiltinId::Sign => {
            if a > 0.0 {
                1.0
            } else if a < 0.0 {
                -1.0
            } else {
                0.0
            }
        }
        BuiltinId::Sin => a.sin(),
        BuiltinId::Sqrt => a.sqrt(),
        BuiltinId::Step => step(time, dt, a, b),
        BuiltinId::Tan => a.tan(),
    }
}

pub(crate) fn ramp(time: f64, slope: f64, start_time: f64, end_time: Option<f64>) -> f64 {
    if time > start_time {
        let done_ramping = match end_time {
            Some(end_time) => end_time.is_finite() && time >= end_time,
            None => false,
        };
        if done_ramping {
            slope * (end_time.unwrap() - start_time)
        } else {
            slope * (time - start_time)
        }
    } else {
        0.0
    }
}

pub(crate) fn step(time: f64, dt: f64, height: f64, step_time: f64) -> f64 {
    if time + dt / 2.0 > step_time {
        height
    } else {
        0.0
    }
}

pub(crate) fn pulse(time: f64, dt: f64, volume: f64, first_pulse: f64, interval: f64) -> f64 {
    if time < first_pulse {
        return 0.0;
    }

    let mut next_pulse = first_pulse;
    while time >= next_pulse {
        if time < next_pulse + dt {
            return volume / dt;
        } else if interval <= 0.0 {
            break;
        } else {
            next_pulse += interval;
        }
    }

    0.0
}

/// Evaluate a graphical function at `index`.
pub(crate) fn lookup(table: &[(f64, f64)], kind: GraphicalFunctionKind, index: f64) -> f64 {
    if table.is_empty() {
        return f64::NAN;
    }

    if index.is_nan() {
        // binary searching for NaN goes nowhere good
        return f64::NAN;
    }

    let size = table.len();

    match kind {
        GraphicalFunctionKind::Discrete => {
            // value of the greatest x at or below index; clamp below
            let mut result = table[0].1;
            for &(x, y) in table.iter() {
                if x > index {
                    break;
                }
                result = y;
            }
            result
        }
        GraphicalFunctionKind::Continuous | GraphicalFunctionKind::Extrapolate => {
            let extrapolate = matches!(kind, GraphicalFunctionKind::Extrapolate);

            if index < table[0].0 {
                let (x0, y0) = table[0];
                if !extrapolate || size < 2 {
                    return y0;
                }
                let (x1, y1) = table[1];
                let slope = (y1 - y0) / (x1 - x0);
                return y0 + slope * (index - x0);
            }

            if index > table[size - 1].0 {
                let (xn, yn) = table[size - 1];
                if !extrapolate || size < 2 {
                    return yn;
                }
                let (xp, yp) = table[size - 2];
                let slope = (yn - yp) / (xn - xp);
                return yn + slope * (index - xn);
            }

            let mut low = 0;
            let mut high = size;
            while low < high {
                let mid = low + (high - low) / 2;
                if table[mid].0 < index {
                    low = mid + 1;
                } else {
                    high = mid;
                }
            }

            let i = low;
            if table[i].0 == index {
                table[i].1
            } else {
                // y = m*x + b
                let slope = (table[i].1 - table[i - 1].1) / (table[i].0 - table[i - 1].0);
                (index - table[i - 1].0) * slope + table[i - 1].1
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_continuous() {
        let table = &[(0.0, 0.0), (1.0, 10.0), (2.0, 30.0)];
        let kind = GraphicalFunctionKind::Continuous;
        assert_eq!(5.0, lookup(table, kind, 0.5));
        assert_eq!(20.0, lookup(table, kind, 1.5));
        // clamps at both ends
        assert_eq!(0.0, lookup(table, kind, -1.0));
        assert_eq!(30.0, lookup(table, kind, 3.0));
        // exact hits
        assert_eq!(10.0, lookup(table, kind, 1.0));
    }

    #[test]
    fn test_lookup_extrapolate() {
        let table = &[(0.0, 0.0), (1.0, 10.0), (2.0, 30.0)];
        let kind = GraphicalFunctionKind::Extrapolate;
        assert_eq!(-10.0, lookup(table, kind, -1.0));
        assert_eq!(50.0, lookup(table, kind, 3.0));
        assert_eq!(5.0, lookup(table, kind, 0.5));
    }

    #[test]
    fn test_lookup_discrete() {
        let table = &[(0.0, 0.0), (1.0, 10.0), (2.0, 30.0)];
        let kind = GraphicalFunctionKind::Discrete;
        assert_eq!(0.0, lookup(table, kind, 0.5));
        assert_eq!(10.0, lookup(table, kind, 1.0));
        assert_eq!(10.0, lookup(table, kind, 1.99));
        assert_eq!(30.0, lookup(table, kind, 5.0));
        assert_eq!(0.0, lookup(table, kind, -1.0));
    }

    #[test]
    fn test_lookup_nan() {
        let table = &[(0.0, 0.0), (1.0, 10.0)];
        assert!(lookup(table, GraphicalFunctionKind::Continuous, f64::NAN).is_nan());
    }

    #[test]
    fn test_step_fn() {
        // a step fires when time + dt/2 crosses the step time
        assert_eq!(0.0, step(0.0, 1.0, 5.0, 1.0));
        assert_eq!(5.0, step(1.0, 1.0, 5.0, 1.0));
        assert_eq!(5.0, step(2.0, 1.0, 5.0, 1.0));
    }

    #[test]
    fn test_pulse_fn() {
        // volume 1 at t=1, no repeat, dt=0.5: magnitude is volume/dt
        assert_eq!(0.0, pulse(0.5, 0.5, 1.0, 1.0, 0.0));
        assert_eq!(2.0, pulse(1.0, 0.5, 1.0, 1.0, 0.0));
        assert_eq!(0.0, pulse(1.5, 0.5, 1.0, 1.0, 0.0));
        // repeating every 2
        assert_eq!(2.0, pulse(3.0, 0.5, 1.0, 1.0, 2.0));
        assert_eq!(0.0, pulse(3.5, 0.5, 1.0, 1.0, 2.0));
    }

    #[test]
    fn test_ramp_fn() {
        assert_eq!(0.0, ramp(0.0, 2.0, 1.0, None));
        assert_eq!(2.0, ramp(2.0, 2.0, 1.0, None));
        // stops accumulating at the end time
        assert_eq!(4.0, ramp(5.0, 2.0, 1.0, Some(3.0)));
        // an infinite end time means ramp forever
        assert_eq!(8.0, ramp(5.0, 2.0, 1.0, Some(f64::INFINITY)));
    }

    #[test]
    fn test_is_truthy() {
        assert!(!is_truthy(0.0));
        assert!(is_truthy(1.0));
        assert!(is_truthy(-0.5));
        assert!(is_truthy(f64::NAN));
    }
}
