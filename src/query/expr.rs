//! Filter, assignment, and ordering expressions.
//!
//! Expressions are evaluated per row. Failures are [`EvalError`] values; the
//! calling stage decides whether an error drops the row or leaves a variable
//! unbound.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::query::binding::Binding;
use crate::query::context::ExecutionContext;
use crate::query::errors::EvalError;
use crate::query::term::{Numeric, Term, Var};

/// Expression tree.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Expr {
    /// Variable reference.
    Var(Var),
    /// Constant term.
    Const(Term),
    /// `=`
    Eq(Box<Expr>, Box<Expr>),
    /// `!=`
    Ne(Box<Expr>, Box<Expr>),
    /// `<`
    Lt(Box<Expr>, Box<Expr>),
    /// `<=`
    Le(Box<Expr>, Box<Expr>),
    /// `>`
    Gt(Box<Expr>, Box<Expr>),
    /// `>=`
    Ge(Box<Expr>, Box<Expr>),
    /// `&&`
    And(Box<Expr>, Box<Expr>),
    /// `||`
    Or(Box<Expr>, Box<Expr>),
    /// `!`
    Not(Box<Expr>),
    /// `+`
    Add(Box<Expr>, Box<Expr>),
    /// `-`
    Subtract(Box<Expr>, Box<Expr>),
    /// `*`
    Multiply(Box<Expr>, Box<Expr>),
    /// `/`
    Divide(Box<Expr>, Box<Expr>),
    /// `BOUND(?v)`
    Bound(Var),
    /// Registered function call.
    Call {
        /// Function name.
        name: String,
        /// Arguments, evaluated left to right.
        #[serde(default)]
        args: Vec<Expr>,
    },
}

macro_rules! binary_ctor {
    ($($fn_name:ident => $variant:ident),* $(,)?) => {
        $(
            #[allow(missing_docs)]
            pub fn $fn_name(lhs: Expr, rhs: Expr) -> Expr {
                Expr::$variant(Box::new(lhs), Box::new(rhs))
            }
        )*
    };
}

impl Expr {
    /// Variable reference by bare name.
    pub fn var(name: impl Into<String>) -> Expr {
        Expr::Var(Var::new(name))
    }

    /// Constant.
    pub fn constant(term: Term) -> Expr {
        Expr::Const(term)
    }

    /// Integer constant.
    pub fn int(value: i64) -> Expr {
        Expr::Const(Term::int(value))
    }

    binary_ctor! {
        eq => Eq,
        ne => Ne,
        lt => Lt,
        le => Le,
        gt => Gt,
        ge => Ge,
        and => And,
        or => Or,
        add => Add,
        subtract => Subtract,
        multiply => Multiply,
        divide => Divide,
    }

    /// Logical negation.
    #[allow(clippy::should_implement_trait)]
    pub fn not(inner: Expr) -> Expr {
        Expr::Not(Box::new(inner))
    }

    /// `BOUND(?name)`.
    pub fn bound(name: impl Into<String>) -> Expr {
        Expr::Bound(Var::new(name))
    }

    /// Function call.
    pub fn call(name: impl Into<String>, args: Vec<Expr>) -> Expr {
        Expr::Call {
            name: name.into(),
            args,
        }
    }

    /// Adds every variable the expression mentions to `out`.
    pub fn collect_vars(&self, out: &mut BTreeSet<Var>) {
        match self {
            Expr::Var(var) | Expr::Bound(var) => {
                out.insert(var.clone());
            }
            Expr::Const(_) => {}
            Expr::Not(inner) => inner.collect_vars(out),
            Expr::Eq(a, b)
            | Expr::Ne(a, b)
            | Expr::Lt(a, b)
            | Expr::Le(a, b)
            | Expr::Gt(a, b)
            | Expr::Ge(a, b)
            | Expr::And(a, b)
            | Expr::Or(a, b)
            | Expr::Add(a, b)
            | Expr::Subtract(a, b)
            | Expr::Multiply(a, b)
            | Expr::Divide(a, b) => {
                a.collect_vars(out);
                b.collect_vars(out);
            }
            Expr::Call { args, .. } => args.iter().for_each(|arg| arg.collect_vars(out)),
        }
    }

    /// Variables the expression mentions.
    pub fn vars(&self) -> BTreeSet<Var> {
        let mut out = BTreeSet::new();
        self.collect_vars(&mut out);
        out
    }

    fn visit_calls<'a>(&'a self, f: &mut impl FnMut(&'a str)) {
        match self {
            Expr::Var(_) | Expr::Const(_) | Expr::Bound(_) => {}
            Expr::Not(inner) => inner.visit_calls(f),
            Expr::Eq(a, b)
            | Expr::Ne(a, b)
            | Expr::Lt(a, b)
            | Expr::Le(a, b)
            | Expr::Gt(a, b)
            | Expr::Ge(a, b)
            | Expr::And(a, b)
            | Expr::Or(a, b)
            | Expr::Add(a, b)
            | Expr::Subtract(a, b)
            | Expr::Multiply(a, b)
            | Expr::Divide(a, b) => {
                a.visit_calls(f);
                b.visit_calls(f);
            }
            Expr::Call { name, args } => {
                f(name);
                args.iter().for_each(|arg| arg.visit_calls(f));
            }
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bin = |f: &mut fmt::Formatter<'_>, op: &str, a: &Expr, b: &Expr| {
            write!(f, "({a} {op} {b})")
        };
        match self {
            Expr::Var(var) => write!(f, "{var}"),
            Expr::Const(term) => write!(f, "{term}"),
            Expr::Eq(a, b) => bin(f, "=", a, b),
            Expr::Ne(a, b) => bin(f, "!=", a, b),
            Expr::Lt(a, b) => bin(f, "<", a, b),
            Expr::Le(a, b) => bin(f, "<=", a, b),
            Expr::Gt(a, b) => bin(f, ">", a, b),
            Expr::Ge(a, b) => bin(f, ">=", a, b),
            Expr::And(a, b) => bin(f, "&&", a, b),
            Expr::Or(a, b) => bin(f, "||", a, b),
            Expr::Add(a, b) => bin(f, "+", a, b),
            Expr::Subtract(a, b) => bin(f, "-", a, b),
            Expr::Multiply(a, b) => bin(f, "*", a, b),
            Expr::Divide(a, b) => bin(f, "/", a, b),
            Expr::Not(inner) => write!(f, "!{inner}"),
            Expr::Bound(var) => write!(f, "bound({var})"),
            Expr::Call { name, args } => {
                write!(f, "{name}(")?;
                for (idx, arg) in args.iter().enumerate() {
                    if idx > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{arg}")?;
                }
                write!(f, ")")
            }
        }
    }
}

type FunctionImpl = dyn Fn(&[Term]) -> Result<Term, EvalError> + Send + Sync;

/// Registered function: optional fixed arity plus implementation.
#[derive(Clone)]
pub struct Function {
    arity: Option<usize>,
    imp: Arc<FunctionImpl>,
}

impl fmt::Debug for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Function").field("arity", &self.arity).finish()
    }
}

/// Name-to-implementation table consulted by [`Expr::Call`].
#[derive(Clone, Debug, Default)]
pub struct FunctionRegistry {
    functions: FxHashMap<String, Function>,
}

impl FunctionRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding `str`, `isIRI`, `isLiteral`, `isBlank`, and `strlen`.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("str", Some(1), |args| match &args[0] {
            Term::Blank(_) => Err(EvalError::type_mismatch("str of blank node")),
            term => Ok(Term::string(term.lexical())),
        });
        registry.register("isIRI", Some(1), |args| Ok(Term::boolean(args[0].is_iri())));
        registry.register("isLiteral", Some(1), |args| {
            Ok(Term::boolean(args[0].is_literal()))
        });
        registry.register("isBlank", Some(1), |args| {
            Ok(Term::boolean(args[0].is_blank()))
        });
        registry.register("strlen", Some(1), |args| match &args[0] {
            Term::Literal(lit) if lit.datatype.is_none() => {
                let len = i64::try_from(lit.lexical.chars().count())
                    .map_err(|_| EvalError::Overflow)?;
                Ok(Term::int(len))
            }
            _ => Err(EvalError::type_mismatch("strlen expects a string literal")),
        });
        registry
    }

    /// Registers or replaces `name`. `arity: None` accepts any argument count.
    pub fn register<F>(&mut self, name: impl Into<String>, arity: Option<usize>, imp: F)
    where
        F: Fn(&[Term]) -> Result<Term, EvalError> + Send + Sync + 'static,
    {
        self.functions.insert(
            name.into(),
            Function {
                arity,
                imp: Arc::new(imp),
            },
        );
    }

    /// Returns true when `name` is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }

    /// Invokes `name` with already evaluated arguments.
    pub fn call(&self, name: &str, args: &[Term]) -> Result<Term, EvalError> {
        let function = self
            .functions
            .get(name)
            .ok_or_else(|| EvalError::UnknownFunction {
                name: name.to_owned(),
            })?;
        if let Some(expected) = function.arity {
            if expected != args.len() {
                return Err(EvalError::Arity {
                    name: name.to_owned(),
                    expected,
                    found: args.len(),
                });
            }
        }
        (function.imp)(args)
    }
}

/// Expression bound to the function registry it will be evaluated with.
#[derive(Clone, Debug)]
pub struct PreparedExpr {
    expr: Expr,
    functions: Arc<FunctionRegistry>,
}

impl PreparedExpr {
    /// Binds `expr` to `functions`.
    pub fn new(expr: Expr, functions: Arc<FunctionRegistry>) -> Self {
        Self { expr, functions }
    }

    /// Underlying expression.
    pub fn expr(&self) -> &Expr {
        &self.expr
    }

    /// Evaluates to a term.
    pub fn eval(&self, binding: &Binding) -> Result<Term, EvalError> {
        eval(&self.expr, binding, &self.functions)
    }

    /// Evaluates to an effective boolean value.
    pub fn test(&self, binding: &Binding) -> Result<bool, EvalError> {
        effective_boolean(&self.eval(binding)?)
    }
}

/// Binds each expression to the context's function registry, in order.
///
/// Unknown function names are reported once here; evaluating them later
/// yields [`EvalError::UnknownFunction`].
pub fn prepare(exprs: &[Expr], ctx: &ExecutionContext) -> Vec<PreparedExpr> {
    let functions = ctx.functions();
    exprs
        .iter()
        .map(|expr| {
            expr.visit_calls(&mut |name| {
                if !functions.contains(name) {
                    warn!(function = name, "expression calls an unregistered function");
                }
            });
            PreparedExpr::new(expr.clone(), Arc::clone(functions))
        })
        .collect()
}

/// SPARQL effective boolean value.
pub fn effective_boolean(term: &Term) -> Result<bool, EvalError> {
    if let Some(value) = term.as_bool() {
        return Ok(value);
    }
    if let Some(num) = term.as_numeric() {
        return Ok(match num {
            Numeric::Integer(v) => v != 0,
            Numeric::Double(v) => v != 0.0 && !v.is_nan(),
        });
    }
    match term {
        Term::Literal(lit) if lit.datatype.is_none() => Ok(!lit.lexical.is_empty()),
        other => Err(EvalError::NoBooleanValue {
            term: other.to_string(),
        }),
    }
}

fn eval(expr: &Expr, binding: &Binding, functions: &FunctionRegistry) -> Result<Term, EvalError> {
    let recurse = |e: &Expr| eval(e, binding, functions);
    match expr {
        Expr::Var(var) => binding
            .get(var)
            .cloned()
            .ok_or_else(|| EvalError::unbound(var)),
        Expr::Const(term) => Ok(term.clone()),
        Expr::Eq(a, b) => Ok(Term::boolean(terms_equal(&recurse(a)?, &recurse(b)?)?)),
        Expr::Ne(a, b) => Ok(Term::boolean(!terms_equal(&recurse(a)?, &recurse(b)?)?)),
        Expr::Lt(a, b) => compare(&recurse(a)?, &recurse(b)?).map(|o| Term::boolean(o.is_lt())),
        Expr::Le(a, b) => compare(&recurse(a)?, &recurse(b)?).map(|o| Term::boolean(o.is_le())),
        Expr::Gt(a, b) => compare(&recurse(a)?, &recurse(b)?).map(|o| Term::boolean(o.is_gt())),
        Expr::Ge(a, b) => compare(&recurse(a)?, &recurse(b)?).map(|o| Term::boolean(o.is_ge())),
        Expr::And(a, b) => {
            let lhs = recurse(a).and_then(|t| effective_boolean(&t));
            let rhs = recurse(b).and_then(|t| effective_boolean(&t));
            match (lhs, rhs) {
                (Ok(false), _) | (_, Ok(false)) => Ok(Term::boolean(false)),
                (Ok(true), Ok(true)) => Ok(Term::boolean(true)),
                (Err(err), _) | (_, Err(err)) => Err(err),
            }
        }
        Expr::Or(a, b) => {
            let lhs = recurse(a).and_then(|t| effective_boolean(&t));
            let rhs = recurse(b).and_then(|t| effective_boolean(&t));
            match (lhs, rhs) {
                (Ok(true), _) | (_, Ok(true)) => Ok(Term::boolean(true)),
                (Ok(false), Ok(false)) => Ok(Term::boolean(false)),
                (Err(err), _) | (_, Err(err)) => Err(err),
            }
        }
        Expr::Not(inner) => Ok(Term::boolean(!effective_boolean(&recurse(inner)?)?)),
        Expr::Add(a, b) => arithmetic(&recurse(a)?, &recurse(b)?, ArithOp::Add),
        Expr::Subtract(a, b) => arithmetic(&recurse(a)?, &recurse(b)?, ArithOp::Subtract),
        Expr::Multiply(a, b) => arithmetic(&recurse(a)?, &recurse(b)?, ArithOp::Multiply),
        Expr::Divide(a, b) => arithmetic(&recurse(a)?, &recurse(b)?, ArithOp::Divide),
        Expr::Bound(var) => Ok(Term::boolean(binding.contains(var))),
        Expr::Call { name, args } => {
            let values = args.iter().map(recurse).collect::<Result<Vec<_>, _>>()?;
            functions.call(name, &values)
        }
    }
}

fn terms_equal(a: &Term, b: &Term) -> Result<bool, EvalError> {
    if let (Some(x), Some(y)) = (a.as_numeric(), b.as_numeric()) {
        return Ok(x.partial_cmp(y) == Some(std::cmp::Ordering::Equal));
    }
    Ok(a == b)
}

fn compare(a: &Term, b: &Term) -> Result<std::cmp::Ordering, EvalError> {
    if let (Some(x), Some(y)) = (a.as_numeric(), b.as_numeric()) {
        return x
            .partial_cmp(y)
            .ok_or_else(|| EvalError::type_mismatch("comparison with NaN"));
    }
    if let (Some(x), Some(y)) = (a.as_bool(), b.as_bool()) {
        return Ok(x.cmp(&y));
    }
    match (a, b) {
        (Term::Literal(x), Term::Literal(y))
            if x.datatype.is_none() && y.datatype.is_none() && x.lang == y.lang =>
        {
            Ok(x.lexical.cmp(&y.lexical))
        }
        _ => Err(EvalError::type_mismatch("incomparable operands")),
    }
}

#[derive(Clone, Copy)]
enum ArithOp {
    Add,
    Subtract,
    Multiply,
    Divide,
}

fn arithmetic(a: &Term, b: &Term, op: ArithOp) -> Result<Term, EvalError> {
    let (x, y) = match (a.as_numeric(), b.as_numeric()) {
        (Some(x), Some(y)) => (x, y),
        _ => return Err(EvalError::type_mismatch("arithmetic on non-numeric operand")),
    };
    let result = match (x, y, op) {
        (Numeric::Integer(_), Numeric::Integer(0), ArithOp::Divide) => {
            return Err(EvalError::DivideByZero)
        }
        (Numeric::Integer(l), Numeric::Integer(r), ArithOp::Divide) if l.checked_rem(r) == Some(0) => {
            Numeric::Integer(l.checked_div(r).ok_or(EvalError::Overflow)?)
        }
        (Numeric::Integer(l), Numeric::Integer(r), ArithOp::Add) => {
            Numeric::Integer(l.checked_add(r).ok_or(EvalError::Overflow)?)
        }
        (Numeric::Integer(l), Numeric::Integer(r), ArithOp::Subtract) => {
            Numeric::Integer(l.checked_sub(r).ok_or(EvalError::Overflow)?)
        }
        (Numeric::Integer(l), Numeric::Integer(r), ArithOp::Multiply) => {
            Numeric::Integer(l.checked_mul(r).ok_or(EvalError::Overflow)?)
        }
        (l, r, op) => {
            let (l, r) = (l.as_f64(), r.as_f64());
            Numeric::Double(match op {
                ArithOp::Add => l + r,
                ArithOp::Subtract => l - r,
                ArithOp::Multiply => l * r,
                ArithOp::Divide => l / r,
            })
        }
    };
    Ok(result.into_term())
}
