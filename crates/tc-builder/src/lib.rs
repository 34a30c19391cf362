#![forbid(unsafe_code)]

use std::collections::BTreeSet;
use std::fmt;

use tc_core::{DType, MatmulPlan, ShapeError, TensorMetaError, checked_numel, ensure_same_shape};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VarId(pub usize);

/// Symbolic value of a program: a named, typed, shaped slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Variable {
    id: VarId,
    name: String,
    dtype: DType,
    shape: Vec<usize>,
}

impl Variable {
    #[must_use]
    pub fn id(&self) -> VarId {
        self.id
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn dtype(&self) -> DType {
        self.dtype
    }

    #[must_use]
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    #[must_use]
    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }
}

impl fmt::Display for Variable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}{:?}", self.name, self.dtype, self.shape)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Instruction {
    Matmul {
        lhs: VarId,
        rhs: VarId,
        out: VarId,
        plan: MatmulPlan,
    },
    Add {
        lhs: VarId,
        rhs: VarId,
        out: VarId,
    },
}

impl Instruction {
    #[must_use]
    pub fn op_name(&self) -> &'static str {
        match self {
            Self::Matmul { .. } => "matmul",
            Self::Add { .. } => "add",
        }
    }

    #[must_use]
    pub fn inputs(&self) -> [VarId; 2] {
        match self {
            Self::Matmul { lhs, rhs, .. } | Self::Add { lhs, rhs, .. } => [*lhs, *rhs],
        }
    }

    #[must_use]
    pub fn output(&self) -> VarId {
        match self {
            Self::Matmul { out, .. } | Self::Add { out, .. } => *out,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BuildError {
    #[error("input names must be non-empty")]
    EmptyName,
    #[error("variable name `{name}` is already declared")]
    DuplicateName { name: String },
    #[error("variable `{name}` does not belong to builder `{builder}`")]
    ForeignVariable { name: String, builder: String },
    #[error("{op}: dtype mismatch between {lhs} and {rhs}")]
    DTypeMismatch {
        op: &'static str,
        lhs: DType,
        rhs: DType,
    },
    #[error("{op}: {source}")]
    Shape {
        op: &'static str,
        #[source]
        source: ShapeError,
    },
    #[error("invalid input shape: {0}")]
    InvalidShape(#[from] TensorMetaError),
    #[error("program `{name}` has no operations")]
    EmptyProgram { name: String },
}

/// Immutable result of [`NetBuilder::build`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Program {
    name: String,
    vars: Vec<Variable>,
    inputs: Vec<VarId>,
    instructions: Vec<Instruction>,
}

impl Program {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Declared inputs in declaration order.
    pub fn inputs(&self) -> impl Iterator<Item = &Variable> + '_ {
        self.inputs.iter().map(|id| &self.vars[id.0])
    }

    #[must_use]
    pub fn instructions(&self) -> &[Instruction] {
        &self.instructions
    }

    #[must_use]
    pub fn variables(&self) -> &[Variable] {
        &self.vars
    }

    #[must_use]
    pub fn variable(&self, id: VarId) -> Option<&Variable> {
        self.vars.get(id.0)
    }

    #[must_use]
    pub fn variable_by_name(&self, name: &str) -> Option<&Variable> {
        self.vars.iter().find(|var| var.name == name)
    }

    #[must_use]
    pub fn is_input(&self, id: VarId) -> bool {
        self.inputs.contains(&id)
    }

    /// Variables produced by an instruction and never consumed by a later one.
    #[must_use]
    pub fn outputs(&self) -> Vec<&Variable> {
        let consumed: BTreeSet<VarId> = self
            .instructions
            .iter()
            .flat_map(Instruction::inputs)
            .collect();
        self.instructions
            .iter()
            .map(Instruction::output)
            .filter(|id| !consumed.contains(id))
            .map(|id| &self.vars[id.0])
            .collect()
    }
}

impl fmt::Display for Program {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "program {} {{", self.name)?;
        for input in self.inputs() {
            writeln!(f, "  input {input}")?;
        }
        for instruction in &self.instructions {
            let [lhs, rhs] = instruction.inputs();
            writeln!(
                f,
                "  {} = {}({}, {})",
                self.vars[instruction.output().0],
                instruction.op_name(),
                self.vars[lhs.0].name,
                self.vars[rhs.0].name
            )?;
        }
        let outputs = self
            .outputs()
            .into_iter()
            .map(|var| var.name.as_str())
            .collect::<Vec<_>>();
        writeln!(f, "  outputs [{}]", outputs.join(", "))?;
        write!(f, "}}")
    }
}

/// Declarative builder: inputs and operations are recorded symbolically and
/// nothing executes until the resulting [`Program`] is compiled.
#[derive(Debug, Clone)]
pub struct NetBuilder {
    name: String,
    vars: Vec<Variable>,
    inputs: Vec<VarId>,
    instructions: Vec<Instruction>,
    names: BTreeSet<String>,
}

impl NetBuilder {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            vars: Vec::new(),
            inputs: Vec::new(),
            instructions: Vec::new(),
            names: BTreeSet::new(),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn create_input(
        &mut self,
        dtype: DType,
        shape: &[usize],
        name: &str,
    ) -> Result<Variable, BuildError> {
        if name.trim().is_empty() {
            return Err(BuildError::EmptyName);
        }
        if self.names.contains(name) {
            return Err(BuildError::DuplicateName {
                name: name.to_owned(),
            });
        }
        checked_numel(shape)?;
        let var = self.push_var(name.to_owned(), dtype, shape.to_vec());
        self.inputs.push(var.id);
        Ok(var)
    }

    pub fn matmul(&mut self, lhs: &Variable, rhs: &Variable) -> Result<Variable, BuildError> {
        self.ensure_owned(lhs)?;
        self.ensure_owned(rhs)?;
        ensure_same_dtype("matmul", lhs, rhs)?;
        let plan = MatmulPlan::new(&lhs.shape, &rhs.shape)
            .map_err(|source| BuildError::Shape { op: "matmul", source })?;
        let name = self.temp_name();
        let out = self.push_var(name, lhs.dtype, plan.output_shape().to_vec());
        self.instructions.push(Instruction::Matmul {
            lhs: lhs.id,
            rhs: rhs.id,
            out: out.id,
            plan,
        });
        Ok(out)
    }

    pub fn add(&mut self, lhs: &Variable, rhs: &Variable) -> Result<Variable, BuildError> {
        self.ensure_owned(lhs)?;
        self.ensure_owned(rhs)?;
        ensure_same_dtype("add", lhs, rhs)?;
        ensure_same_shape(&lhs.shape, &rhs.shape)
            .map_err(|source| BuildError::Shape { op: "add", source })?;
        let name = self.temp_name();
        let out = self.push_var(name, lhs.dtype, lhs.shape.clone());
        self.instructions.push(Instruction::Add {
            lhs: lhs.id,
            rhs: rhs.id,
            out: out.id,
        });
        Ok(out)
    }

    pub fn build(self) -> Result<Program, BuildError> {
        if self.instructions.is_empty() {
            return Err(BuildError::EmptyProgram { name: self.name });
        }
        Ok(Program {
            name: self.name,
            vars: self.vars,
            inputs: self.inputs,
            instructions: self.instructions,
        })
    }

    fn temp_name(&self) -> String {
        let mut index = self.instructions.len();
        loop {
            let candidate = format!("{}_tmp_{index}", self.name);
            if !self.names.contains(&candidate) {
                return candidate;
            }
            index += 1;
        }
    }

    fn push_var(&mut self, name: String, dtype: DType, shape: Vec<usize>) -> Variable {
        let var = Variable {
            id: VarId(self.vars.len()),
            name,
            dtype,
            shape,
        };
        self.names.insert(var.name.clone());
        self.vars.push(var.clone());
        var
    }

    fn ensure_owned(&self, var: &Variable) -> Result<(), BuildError> {
        match self.vars.get(var.id.0) {
            Some(known) if known == var => Ok(()),
            _ => Err(BuildError::ForeignVariable {
                name: var.name.clone(),
                builder: self.name.clone(),
            }),
        }
    }
}

fn ensure_same_dtype(op: &'static str, lhs: &Variable, rhs: &Variable) -> Result<(), BuildError> {
    if lhs.dtype != rhs.dtype {
        return Err(BuildError::DTypeMismatch {
            op,
            lhs: lhs.dtype,
            rhs: rhs.dtype,
        });
    }
    Ok(())
}
