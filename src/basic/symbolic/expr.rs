use std::{
    collections::{BTreeSet, HashSet},
    fmt,
    ops::{Add, Div, Mul, Neg, Sub},
    sync::Arc,
};

/// Interned symbol name.
pub type Symbol = Arc<str>;

/// Expression tree used to author device equations.
///
/// Sums and products are n-ary and always built through the simplifying
/// constructors ([`Expr::sum`], [`Expr::product`], [`Expr::pow`]), so nested
/// sums are flattened, numeric constants are folded and multiplications by
/// zero disappear. That is enough for the derivatives of linear device
/// equations to come out as symbol-only coefficients.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// Numeric constant.
    Const(f64),
    /// Named constant, primal or dual symbol.
    Sym(Symbol),
    /// Sum of terms.
    Sum(Vec<Expr>),
    /// Product of factors.
    Product(Vec<Expr>),
    /// Integer power.
    Pow(Box<Expr>, i32),
    /// Square root.
    Sqrt(Box<Expr>),
}

impl Expr {
    pub fn zero() -> Self {
        Expr::Const(0.0)
    }

    pub fn one() -> Self {
        Expr::Const(1.0)
    }

    pub fn sym(name: &str) -> Self {
        Expr::Sym(Arc::from(name))
    }

    pub fn is_zero(&self) -> bool {
        matches!(self, Expr::Const(c) if *c == 0.0)
    }

    pub fn is_one(&self) -> bool {
        matches!(self, Expr::Const(c) if *c == 1.0)
    }

    /// Builds a flattened sum with all numeric terms folded into one.
    pub fn sum(terms: impl IntoIterator<Item = Expr>) -> Self {
        fn push(term: Expr, constant: &mut f64, out: &mut Vec<Expr>) {
            match term {
                Expr::Const(c) => *constant += c,
                Expr::Sum(inner) => inner.into_iter().for_each(|t| push(t, constant, out)),
                other => out.push(other),
            }
        }
        let mut constant = 0.0;
        let mut out = Vec::new();
        for term in terms {
            push(term, &mut constant, &mut out);
        }
        if constant != 0.0 {
            out.push(Expr::Const(constant));
        }
        match out.len() {
            0 => Expr::zero(),
            1 => out.pop().unwrap_or_else(Expr::zero),
            _ => Expr::Sum(out),
        }
    }

    /// Builds a flattened product; any zero factor collapses it to zero.
    pub fn product(factors: impl IntoIterator<Item = Expr>) -> Self {
        fn push(factor: Expr, constant: &mut f64, out: &mut Vec<Expr>) {
            match factor {
                Expr::Const(c) => *constant *= c,
                Expr::Product(inner) => inner.into_iter().for_each(|f| push(f, constant, out)),
                other => out.push(other),
            }
        }
        let mut constant = 1.0;
        let mut out = Vec::new();
        for factor in factors {
            push(factor, &mut constant, &mut out);
        }
        if constant == 0.0 {
            return Expr::zero();
        }
        if out.is_empty() {
            return Expr::Const(constant);
        }
        if constant != 1.0 {
            out.insert(0, Expr::Const(constant));
        }
        match out.len() {
            1 => out.pop().unwrap_or_else(Expr::one),
            _ => Expr::Product(out),
        }
    }

    pub fn pow(base: Expr, exponent: i32) -> Self {
        match (base, exponent) {
            (_, 0) => Expr::one(),
            (base, 1) => base,
            (Expr::Const(c), n) => Expr::Const(c.powi(n)),
            (Expr::Pow(inner, m), n) => Expr::pow(*inner, m * n),
            (base, n) => Expr::Pow(Box::new(base), n),
        }
    }

    pub fn sqrt(base: Expr) -> Self {
        match base {
            Expr::Const(c) if c >= 0.0 => Expr::Const(c.sqrt()),
            other => Expr::Sqrt(Box::new(other)),
        }
    }

    pub fn recip(self) -> Self {
        Expr::pow(self, -1)
    }

    /// True if `name` appears anywhere in the tree.
    pub fn contains(&self, name: &str) -> bool {
        match self {
            Expr::Const(_) => false,
            Expr::Sym(s) => &**s == name,
            Expr::Sum(items) | Expr::Product(items) => items.iter().any(|e| e.contains(name)),
            Expr::Pow(base, _) | Expr::Sqrt(base) => base.contains(name),
        }
    }

    /// True if any symbol of `names` appears in the tree.
    pub fn depends_on_any(&self, names: &HashSet<Symbol>) -> bool {
        match self {
            Expr::Const(_) => false,
            Expr::Sym(s) => names.contains(s),
            Expr::Sum(items) | Expr::Product(items) => {
                items.iter().any(|e| e.depends_on_any(names))
            }
            Expr::Pow(base, _) | Expr::Sqrt(base) => base.depends_on_any(names),
        }
    }

    pub fn free_symbols(&self) -> BTreeSet<Symbol> {
        fn walk(e: &Expr, out: &mut BTreeSet<Symbol>) {
            match e {
                Expr::Const(_) => {}
                Expr::Sym(s) => {
                    out.insert(s.clone());
                }
                Expr::Sum(items) | Expr::Product(items) => items.iter().for_each(|i| walk(i, out)),
                Expr::Pow(base, _) | Expr::Sqrt(base) => walk(base, out),
            }
        }
        let mut out = BTreeSet::new();
        walk(self, &mut out);
        out
    }

    /// Symbolic partial derivative with respect to `name`.
    pub fn diff(&self, name: &str) -> Expr {
        if !self.contains(name) {
            return Expr::zero();
        }
        match self {
            Expr::Const(_) => Expr::zero(),
            Expr::Sym(s) => {
                if &**s == name {
                    Expr::one()
                } else {
                    Expr::zero()
                }
            }
            Expr::Sum(terms) => Expr::sum(terms.iter().map(|t| t.diff(name))),
            Expr::Product(factors) => {
                let mut terms = Vec::with_capacity(factors.len());
                for (i, factor) in factors.iter().enumerate() {
                    let d = factor.diff(name);
                    if d.is_zero() {
                        continue;
                    }
                    let rest = factors
                        .iter()
                        .enumerate()
                        .map(|(j, f)| if i == j { d.clone() } else { f.clone() });
                    terms.push(Expr::product(rest));
                }
                Expr::sum(terms)
            }
            Expr::Pow(base, n) => Expr::product([
                Expr::Const(*n as f64),
                Expr::pow((**base).clone(), n - 1),
                base.diff(name),
            ]),
            Expr::Sqrt(base) => Expr::product([
                Expr::Const(0.5),
                base.diff(name),
                Expr::pow(self.clone(), -1),
            ]),
        }
    }

    /// Replaces symbols for which `f` returns a value, re-simplifying on the way up.
    pub fn substitute(&self, f: &impl Fn(&Symbol) -> Option<Expr>) -> Expr {
        match self {
            Expr::Const(c) => Expr::Const(*c),
            Expr::Sym(s) => f(s).unwrap_or_else(|| self.clone()),
            Expr::Sum(terms) => Expr::sum(terms.iter().map(|t| t.substitute(f))),
            Expr::Product(factors) => Expr::product(factors.iter().map(|t| t.substitute(f))),
            Expr::Pow(base, n) => Expr::pow(base.substitute(f), *n),
            Expr::Sqrt(base) => Expr::sqrt(base.substitute(f)),
        }
    }

    /// Scalar evaluation, `None` if a symbol has no value.
    pub fn eval(&self, lookup: &impl Fn(&str) -> Option<f64>) -> Option<f64> {
        Some(match self {
            Expr::Const(c) => *c,
            Expr::Sym(s) => lookup(s)?,
            Expr::Sum(terms) => {
                let mut acc = 0.0;
                for t in terms {
                    acc += t.eval(lookup)?;
                }
                acc
            }
            Expr::Product(factors) => {
                let mut acc = 1.0;
                for f in factors {
                    acc *= f.eval(lookup)?;
                }
                acc
            }
            Expr::Pow(base, n) => base.eval(lookup)?.powi(*n),
            Expr::Sqrt(base) => base.eval(lookup)?.sqrt(),
        })
    }
}

impl fmt::Display for Expr {
    /// Canonical text form; [`parse_expression`](super::parse_expression) reads it back.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn join(f: &mut fmt::Formatter<'_>, items: &[Expr], sep: &str) -> fmt::Result {
            write!(f, "(")?;
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    write!(f, "{sep}")?;
                }
                write!(f, "{item}")?;
            }
            write!(f, ")")
        }
        match self {
            Expr::Const(c) if *c < 0.0 => write!(f, "(-{})", -c),
            Expr::Const(c) => write!(f, "{c}"),
            Expr::Sym(s) => write!(f, "{s}"),
            Expr::Sum(terms) => join(f, terms, " + "),
            Expr::Product(factors) => join(f, factors, " * "),
            Expr::Pow(base, n) if *n < 0 => write!(f, "{base}^(-{})", -n),
            Expr::Pow(base, n) => write!(f, "{base}^{n}"),
            Expr::Sqrt(base) => write!(f, "sqrt({base})"),
        }
    }
}

impl From<f64> for Expr {
    fn from(value: f64) -> Self {
        Expr::Const(value)
    }
}

impl From<&str> for Expr {
    fn from(name: &str) -> Self {
        Expr::sym(name)
    }
}

impl Add for Expr {
    type Output = Expr;
    fn add(self, rhs: Expr) -> Expr {
        Expr::sum([self, rhs])
    }
}

impl Sub for Expr {
    type Output = Expr;
    fn sub(self, rhs: Expr) -> Expr {
        Expr::sum([self, -rhs])
    }
}

impl Mul for Expr {
    type Output = Expr;
    fn mul(self, rhs: Expr) -> Expr {
        Expr::product([self, rhs])
    }
}

impl Div for Expr {
    type Output = Expr;
    fn div(self, rhs: Expr) -> Expr {
        Expr::product([self, rhs.recip()])
    }
}

impl Neg for Expr {
    type Output = Expr;
    fn neg(self) -> Expr {
        Expr::product([Expr::Const(-1.0), self])
    }
}
