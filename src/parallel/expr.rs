//! Expression trees with implicit parallel evaluation
//!
//! Operands of a binary operator, elements of a list, and arguments of a call are
//! independent and are evaluated in parallel. `and then` / `or else` are the
//! sequential, short-circuiting forms. Literal operands are cheap enough that they
//! are evaluated inline instead of becoming task units.

use std::fmt;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::parallel::fork_join::{and_then, fork_join, fork_join_all, or_else, Thunk};
use crate::runtime::{Scheduler, Value};

/// Binary operators that evaluate both operands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    /// `+` (integers, floats, string concatenation)
    Add,
    /// `-`
    Sub,
    /// `*`
    Mul,
    /// `/` (integer division truncates)
    Div,
    /// `mod` (floored: a non-zero result has the sign of the divisor, so `-7 mod 3 = 2`
    /// and `7 mod -3 = -2`)
    Mod,
    /// `=`
    Eq,
    /// `/=`
    NotEq,
    /// `<`
    Lt,
    /// `<=`
    LtEq,
    /// `>`
    Gt,
    /// `>=`
    GtEq,
    /// `and` without short-circuit
    And,
    /// `or` without short-circuit
    Or,
    /// `xor`
    Xor,
}

impl BinaryOp {
    /// Surface spelling of the operator
    pub fn symbol(self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Mod => "mod",
            BinaryOp::Eq => "=",
            BinaryOp::NotEq => "/=",
            BinaryOp::Lt => "<",
            BinaryOp::LtEq => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::GtEq => ">=",
            BinaryOp::And => "and",
            BinaryOp::Or => "or",
            BinaryOp::Xor => "xor",
        }
    }

    /// Combine two evaluated operands
    pub fn apply(self, left: Value, right: Value) -> Result<Value> {
        match self {
            BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div | BinaryOp::Mod => {
                self.arithmetic(left, right)
            }
            BinaryOp::Eq => Ok(Value::Bool(left == right)),
            BinaryOp::NotEq => Ok(Value::Bool(left != right)),
            BinaryOp::Lt | BinaryOp::LtEq | BinaryOp::Gt | BinaryOp::GtEq => self.compare(left, right),
            BinaryOp::And => Ok(Value::Bool(left.as_bool()? & right.as_bool()?)),
            BinaryOp::Or => Ok(Value::Bool(left.as_bool()? | right.as_bool()?)),
            BinaryOp::Xor => Ok(Value::Bool(left.as_bool()? ^ right.as_bool()?)),
        }
    }

    fn invalid(self, left: &Value, right: &Value) -> Error {
        Error::InvalidOperation {
            op: self.symbol().to_string(),
            left_type: left.type_name(),
            right_type: right.type_name(),
        }
    }

    fn arithmetic(self, left: Value, right: Value) -> Result<Value> {
        match (&left, &right) {
            (Value::Int(a), Value::Int(b)) => {
                let (a, b) = (*a, *b);
                let result = match self {
                    BinaryOp::Add => a.checked_add(b),
                    BinaryOp::Sub => a.checked_sub(b),
                    BinaryOp::Mul => a.checked_mul(b),
                    BinaryOp::Div if b == 0 => return Err(Error::DivisionByZero),
                    BinaryOp::Div => a.checked_div(b),
                    BinaryOp::Mod if b == 0 => return Err(Error::DivisionByZero),
                    BinaryOp::Mod => a
                        .checked_rem(b)
                        .map(|r| if r != 0 && (r < 0) != (b < 0) { r + b } else { r }),
                    _ => None,
                };
                result
                    .map(Value::Int)
                    .ok_or_else(|| Error::runtime(format!("integer overflow in {} {} {}", a, self.symbol(), b)))
            }
            (Value::Int(_) | Value::Float(_), Value::Int(_) | Value::Float(_)) => {
                let (a, b) = (left.as_float()?, right.as_float()?);
                match self {
                    BinaryOp::Add => Ok(Value::Float(a + b)),
                    BinaryOp::Sub => Ok(Value::Float(a - b)),
                    BinaryOp::Mul => Ok(Value::Float(a * b)),
                    BinaryOp::Div if b == 0.0 => Err(Error::DivisionByZero),
                    BinaryOp::Div => Ok(Value::Float(a / b)),
                    _ => Err(self.invalid(&left, &right)),
                }
            }
            (Value::String(a), Value::String(b)) if self == BinaryOp::Add => {
                Ok(Value::String(format!("{}{}", a, b)))
            }
            _ => Err(self.invalid(&left, &right)),
        }
    }

    fn compare(self, left: Value, right: Value) -> Result<Value> {
        let ordering = match (&left, &right) {
            (Value::String(a), Value::String(b)) => a.partial_cmp(b),
            (Value::Int(a), Value::Int(b)) => a.partial_cmp(b),
            (Value::Int(_) | Value::Float(_), Value::Int(_) | Value::Float(_)) => {
                left.as_float()?.partial_cmp(&right.as_float()?)
            }
            _ => None,
        };
        let ordering = ordering.ok_or_else(|| self.invalid(&left, &right))?;
        Ok(Value::Bool(match self {
            BinaryOp::Lt => ordering.is_lt(),
            BinaryOp::LtEq => ordering.is_le(),
            BinaryOp::Gt => ordering.is_gt(),
            _ => ordering.is_ge(),
        }))
    }
}

type Body = Arc<dyn Fn(&Evaluator, &[Value]) -> Result<Value> + Send + Sync>;
type Condition = Arc<dyn Fn(&[Value]) -> bool + Send + Sync>;

/// A callable with an optional precondition checked before its body runs
#[derive(Clone)]
pub struct Function {
    name: String,
    arity: usize,
    precondition: Option<(String, Condition)>,
    body: Body,
}

impl Function {
    /// Create a function taking `arity` arguments
    pub fn new<F>(name: impl Into<String>, arity: usize, body: F) -> Self
    where
        F: Fn(&Evaluator, &[Value]) -> Result<Value> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            arity,
            precondition: None,
            body: Arc::new(body),
        }
    }

    /// Attach a precondition; `description` is reported when it fails
    pub fn with_precondition<P>(mut self, description: impl Into<String>, condition: P) -> Self
    where
        P: Fn(&[Value]) -> bool + Send + Sync + 'static,
    {
        self.precondition = Some((description.into(), Arc::new(condition)));
        self
    }

    /// Function name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of parameters
    pub fn arity(&self) -> usize {
        self.arity
    }

    /// Invoke with already-evaluated arguments
    pub fn call(&self, evaluator: &Evaluator, args: &[Value]) -> Result<Value> {
        if args.len() != self.arity {
            return Err(Error::ArityMismatch {
                function: self.name.clone(),
                expected: self.arity,
                got: args.len(),
            });
        }
        if let Some((description, condition)) = &self.precondition {
            if !condition(args) {
                tracing::debug!(function = %self.name, %description, "precondition violated");
                return Err(Error::precondition(&self.name, description));
            }
        }
        (self.body)(evaluator, args)
    }
}

impl fmt::Debug for Function {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Function")
            .field("name", &self.name)
            .field("arity", &self.arity)
            .field("precondition", &self.precondition.as_ref().map(|(d, _)| d))
            .finish()
    }
}

/// Expression tree
#[derive(Clone)]
pub enum Expr {
    /// Constant value
    Literal(Value),
    /// Opaque leaf computed by host code
    Thunk(Arc<dyn Fn() -> Result<Value> + Send + Sync>),
    /// Binary operator; operands evaluated in parallel
    Binary {
        /// Operator
        op: BinaryOp,
        /// Left operand
        left: Arc<Expr>,
        /// Right operand
        right: Arc<Expr>,
    },
    /// `not`
    Not(Arc<Expr>),
    /// `and then`; right evaluated only when left is true
    AndThen(Arc<Expr>, Arc<Expr>),
    /// `or else`; right evaluated only when left is false
    OrElse(Arc<Expr>, Arc<Expr>),
    /// `if cond then a else b`; only the chosen branch is evaluated
    If {
        /// Condition
        condition: Arc<Expr>,
        /// Value when true
        then: Arc<Expr>,
        /// Value when false
        otherwise: Arc<Expr>,
    },
    /// Tuple of independent expressions
    List(Vec<Arc<Expr>>),
    /// Function call; arguments evaluated in parallel
    Call {
        /// Callee
        function: Arc<Function>,
        /// Argument expressions
        args: Vec<Arc<Expr>>,
    },
}

impl Expr {
    /// Literal leaf
    pub fn lit(value: impl Into<Value>) -> Arc<Expr> {
        Arc::new(Expr::Literal(value.into()))
    }

    /// Host-computed leaf
    pub fn thunk<F>(f: F) -> Arc<Expr>
    where
        F: Fn() -> Result<Value> + Send + Sync + 'static,
    {
        Arc::new(Expr::Thunk(Arc::new(f)))
    }

    /// Binary operator node
    pub fn binary(op: BinaryOp, left: Arc<Expr>, right: Arc<Expr>) -> Arc<Expr> {
        Arc::new(Expr::Binary { op, left, right })
    }

    /// `left + right`
    pub fn add(left: Arc<Expr>, right: Arc<Expr>) -> Arc<Expr> {
        Self::binary(BinaryOp::Add, left, right)
    }

    /// `left * right`
    pub fn mul(left: Arc<Expr>, right: Arc<Expr>) -> Arc<Expr> {
        Self::binary(BinaryOp::Mul, left, right)
    }

    /// `not operand`
    pub fn not(operand: Arc<Expr>) -> Arc<Expr> {
        Arc::new(Expr::Not(operand))
    }

    /// `left and then right`
    pub fn and_then(left: Arc<Expr>, right: Arc<Expr>) -> Arc<Expr> {
        Arc::new(Expr::AndThen(left, right))
    }

    /// `left or else right`
    pub fn or_else(left: Arc<Expr>, right: Arc<Expr>) -> Arc<Expr> {
        Arc::new(Expr::OrElse(left, right))
    }

    /// Conditional expression
    pub fn if_then_else(condition: Arc<Expr>, then: Arc<Expr>, otherwise: Arc<Expr>) -> Arc<Expr> {
        Arc::new(Expr::If {
            condition,
            then,
            otherwise,
        })
    }

    /// Tuple expression
    pub fn list(items: Vec<Arc<Expr>>) -> Arc<Expr> {
        Arc::new(Expr::List(items))
    }

    /// Call expression
    pub fn call(function: Arc<Function>, args: Vec<Arc<Expr>>) -> Arc<Expr> {
        Arc::new(Expr::Call { function, args })
    }

    fn is_trivial(&self) -> bool {
        matches!(self, Expr::Literal(_))
    }
}

impl fmt::Debug for Expr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Expr::Literal(v) => write!(f, "{}", v),
            Expr::Thunk(_) => write!(f, "<thunk>"),
            Expr::Binary { op, left, right } => write!(f, "({:?} {} {:?})", left, op.symbol(), right),
            Expr::Not(e) => write!(f, "(not {:?})", e),
            Expr::AndThen(l, r) => write!(f, "({:?} and then {:?})", l, r),
            Expr::OrElse(l, r) => write!(f, "({:?} or else {:?})", l, r),
            Expr::If {
                condition,
                then,
                otherwise,
            } => write!(f, "(if {:?} then {:?} else {:?})", condition, then, otherwise),
            Expr::List(items) => f.debug_list().entries(items.iter()).finish(),
            Expr::Call { function, args } => {
                write!(f, "{}", function.name())?;
                f.debug_tuple("").field(args).finish()
            }
        }
    }
}

/// Evaluates expression trees on a scheduler
#[derive(Clone, Debug)]
pub struct Evaluator {
    scheduler: Scheduler,
}

impl Default for Evaluator {
    fn default() -> Self {
        Self::new(Scheduler::global().clone())
    }
}

impl Evaluator {
    /// Evaluator submitting its task units to `scheduler`
    pub fn new(scheduler: Scheduler) -> Self {
        Self { scheduler }
    }

    /// Scheduler the evaluator forks onto
    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Evaluate `expr`
    pub fn eval(&self, expr: &Arc<Expr>) -> Result<Value> {
        match expr.as_ref() {
            Expr::Literal(value) => Ok(value.clone()),
            Expr::Thunk(f) => f(),
            Expr::Binary { op, left, right } => self.eval_binary(*op, left, right),
            Expr::Not(operand) => Ok(Value::Bool(!self.eval(operand)?.as_bool()?)),
            Expr::AndThen(left, right) => and_then(
                || self.eval(left)?.as_bool(),
                || self.eval(right)?.as_bool(),
            )
            .map(Value::Bool),
            Expr::OrElse(left, right) => or_else(
                || self.eval(left)?.as_bool(),
                || self.eval(right)?.as_bool(),
            )
            .map(Value::Bool),
            Expr::If {
                condition,
                then,
                otherwise,
            } => {
                if self.eval(condition)?.as_bool()? {
                    self.eval(then)
                } else {
                    self.eval(otherwise)
                }
            }
            Expr::List(items) => self.eval_all(items).map(Value::array),
            Expr::Call { function, args } => {
                let args = self.eval_all(args)?;
                function.call(self, &args)
            }
        }
    }

    /// Evaluate a list of independent expressions in parallel
    pub fn eval_all(&self, exprs: &[Arc<Expr>]) -> Result<Vec<Value>> {
        if exprs.iter().filter(|e| !e.is_trivial()).count() <= 1 {
            return exprs.iter().map(|e| self.eval(e)).collect();
        }
        let thunks: Vec<Thunk<Value>> = exprs
            .iter()
            .map(|e| {
                let evaluator = self.clone();
                let e = Arc::clone(e);
                Box::new(move || evaluator.eval(&e)) as Thunk<Value>
            })
            .collect();
        fork_join_all(&self.scheduler, thunks)
    }

    fn eval_binary(&self, op: BinaryOp, left: &Arc<Expr>, right: &Arc<Expr>) -> Result<Value> {
        if left.is_trivial() || right.is_trivial() {
            let (l, r) = (self.eval(left)?, self.eval(right)?);
            return op.apply(l, r);
        }
        let evaluator = self.clone();
        let right = Arc::clone(right);
        fork_join(
            &self.scheduler,
            || self.eval(left),
            move || evaluator.eval(&right),
            |l, r| op.apply(l, r),
        )
    }
}
