use crate::lang::value::{Value, VarType};
use std::collections::HashMap;

/// Host implementation of a native function. Arguments arrive in declaration
/// order with string arguments already materialized; `Ok(None)` means void.
pub type NativeFn = fn(&[Value]) -> Result<Option<Value>, String>;

#[derive(Debug, Clone)]
pub struct NativeSymbol {
    pub params: Vec<VarType>,
    pub return_type: VarType,
    pub func: NativeFn,
}

impl NativeSymbol {
    pub fn signature(&self) -> String {
        signature(&self.params, self.return_type)
    }
}

pub fn signature(params: &[VarType], return_type: VarType) -> String {
    let params: Vec<&str> = params.iter().map(|t| t.name()).collect();
    format!("({}) -> {}", params.join(", "), return_type)
}

/// Symbol table the compiler binds `native 'name'` bodies against and the
/// interpreter dispatches `CALLNATIVE` through.
#[derive(Debug, Clone, Default)]
pub struct NativeRegistry {
    symbols: HashMap<String, NativeSymbol>,
}

impl NativeRegistry {
    /// An empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// The built-in platform symbols.
    pub fn platform() -> Self {
        use VarType::{Double, Int, String};

        let mut registry = Self::new();
        registry.register("sqrt", &[Double], Double, |a| unary_f64(a, f64::sqrt));
        registry.register("sin", &[Double], Double, |a| unary_f64(a, f64::sin));
        registry.register("cos", &[Double], Double, |a| unary_f64(a, f64::cos));
        registry.register("tan", &[Double], Double, |a| unary_f64(a, f64::tan));
        registry.register("exp", &[Double], Double, |a| unary_f64(a, f64::exp));
        registry.register("log", &[Double], Double, |a| unary_f64(a, f64::ln));
        registry.register("fabs", &[Double], Double, |a| unary_f64(a, f64::abs));
        registry.register("floor", &[Double], Double, |a| unary_f64(a, f64::floor));
        registry.register("ceil", &[Double], Double, |a| unary_f64(a, f64::ceil));
        registry.register("pow", &[Double, Double], Double, |a| {
            Ok(Some(Value::Double(f64_arg(a, 0)?.powf(f64_arg(a, 1)?))))
        });
        registry.register("abs", &[Int], Int, |a| {
            Ok(Some(Value::Int(i64_arg(a, 0)?.wrapping_abs())))
        });
        registry.register("labs", &[Int], Int, |a| {
            Ok(Some(Value::Int(i64_arg(a, 0)?.wrapping_abs())))
        });
        registry.register("strlen", &[String], Int, |a| {
            Ok(Some(Value::Int(str_arg(a, 0)?.len() as i64)))
        });
        registry.register("atoi", &[String], Int, |a| {
            Ok(Some(Value::Int(atoi(str_arg(a, 0)?))))
        });
        registry
    }

    pub fn register(
        &mut self,
        name: impl Into<String>,
        params: &[VarType],
        return_type: VarType,
        func: NativeFn,
    ) {
        self.symbols.insert(
            name.into(),
            NativeSymbol {
                params: params.to_vec(),
                return_type,
                func,
            },
        );
    }

    pub fn lookup(&self, name: &str) -> Option<&NativeSymbol> {
        self.symbols.get(name)
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }
}

fn unary_f64(args: &[Value], f: fn(f64) -> f64) -> Result<Option<Value>, String> {
    Ok(Some(Value::Double(f(f64_arg(args, 0)?))))
}

fn f64_arg(args: &[Value], i: usize) -> Result<f64, String> {
    args.get(i)
        .and_then(Value::as_double)
        .ok_or_else(|| format!("argument {} is not a double", i))
}

fn i64_arg(args: &[Value], i: usize) -> Result<i64, String> {
    args.get(i)
        .and_then(Value::as_int)
        .ok_or_else(|| format!("argument {} is not an int", i))
}

fn str_arg(args: &[Value], i: usize) -> Result<&str, String> {
    args.get(i)
        .and_then(Value::as_host_str)
        .ok_or_else(|| format!("argument {} is not a string", i))
}

// Leading whitespace, optional sign, then digits; anything else stops the scan.
fn atoi(s: &str) -> i64 {
    let s = s.trim_start();
    let (negative, digits) = match s.as_bytes().first() {
        Some(b'-') => (true, &s[1..]),
        Some(b'+') => (false, &s[1..]),
        _ => (false, s),
    };
    let mut n: i64 = 0;
    for b in digits.bytes().take_while(u8::is_ascii_digit) {
        n = n.wrapping_mul(10).wrapping_add((b - b'0') as i64);
    }
    if negative { n.wrapping_neg() } else { n }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(registry: &NativeRegistry, name: &str, args: &[Value]) -> Option<Value> {
        let symbol = registry.lookup(name).expect("symbol registered");
        (symbol.func)(args).expect("native call succeeds")
    }

    #[test]
    fn test_platform_math() {
        let natives = NativeRegistry::platform();
        assert_eq!(
            call(&natives, "sqrt", &[Value::Double(16.0)]),
            Some(Value::Double(4.0))
        );
        assert_eq!(
            call(&natives, "pow", &[Value::Double(2.0), Value::Double(10.0)]),
            Some(Value::Double(1024.0))
        );
        assert_eq!(call(&natives, "abs", &[Value::Int(-5)]), Some(Value::Int(5)));
    }

    #[test]
    fn test_platform_strings() {
        let natives = NativeRegistry::platform();
        assert_eq!(
            call(&natives, "strlen", &[Value::string("hello")]),
            Some(Value::Int(5))
        );
        assert_eq!(
            call(&natives, "atoi", &[Value::string("  -42abc")]),
            Some(Value::Int(-42))
        );
        assert_eq!(call(&natives, "atoi", &[Value::string("x")]), Some(Value::Int(0)));
    }

    #[test]
    fn test_wrong_argument_type_is_reported() {
        let natives = NativeRegistry::platform();
        let sqrt = natives.lookup("sqrt").unwrap();
        assert!((sqrt.func)(&[Value::Int(4)]).is_err());
    }

    #[test]
    fn test_register_and_signature() {
        let mut natives = NativeRegistry::new();
        assert!(natives.is_empty());
        natives.register("answer", &[], VarType::Int, |_| Ok(Some(Value::Int(42))));
        assert_eq!(natives.len(), 1);
        assert_eq!(natives.lookup("answer").unwrap().signature(), "() -> int");
        assert!(natives.lookup("missing").is_none());
    }
}
