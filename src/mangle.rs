//! Function name mangling.
//!
//! Every defined function except `main` gets `_XF<len><name><type>`,
//! where the type mangle is structural: `P<T>` for pointers, `A<n>E<T>`
//! for arrays, `F<ret><params...>E` for functions, and `<len><name>` for
//! named and primitive types. Extern functions keep their import name.

use crate::ast::Type;
use crate::ir::Module;

pub fn mangle_type(ty: &Type) -> String {
    match ty {
        Type::Void => "4void".to_owned(),
        Type::Integer | Type::IntegerLiteral => "7integer".to_owned(),
        Type::Byte => "4byte".to_owned(),
        Type::Pointer(to) => format!("P{}", mangle_type(to)),
        Type::Array { len, of } => format!("A{len}E{}", mangle_type(of)),
        Type::Function { ret, params } => {
            let mut out = String::from("F");
            out.push_str(&mangle_type(ret));
            for p in params {
                out.push_str(&mangle_type(p));
            }
            out.push('E');
            out
        }
        Type::Named { name, .. } => format!("{}{}", name.len(), name),
    }
}

pub fn mangle_function_name(name: &str, ty: &Type) -> String {
    format!("_XF{}{}{}", name.len(), name, mangle_type(ty))
}

/// Mangle every function in the module, skipping externs and `main`.
pub fn apply(module: &mut Module) {
    for id in module.funcs.ids() {
        let func = &module.funcs[id];
        if func.attrs.is_extern || func.name == "main" {
            continue;
        }
        let mangled = mangle_function_name(&func.name, &func.ty);
        log::trace!("mangle: {} -> {mangled}", func.name);
        module.funcs[id].name = mangled;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::Builder;

    #[test]
    fn primitive_and_pointer_mangles() {
        assert_eq!(mangle_type(&Type::Integer), "7integer");
        assert_eq!(mangle_type(&Type::Byte.ptr()), "P4byte");
        let arr = Type::Array {
            len: 3,
            of: Box::new(Type::Integer),
        };
        assert_eq!(mangle_type(&arr), "A3E7integer");
    }

    #[test]
    fn function_mangle_is_structural() {
        let ty = Type::Function {
            ret: Box::new(Type::Integer),
            params: vec![Type::Integer, Type::Byte.ptr()],
        };
        assert_eq!(
            mangle_function_name("add", &ty),
            "_XF3addF7integer7integerP4byteE"
        );
    }

    #[test]
    fn main_and_externs_are_exempt() {
        let mut module = Module::new();
        let main_ty = Type::Function {
            ret: Box::new(Type::Integer),
            params: vec![],
        };
        {
            let mut b = Builder::function(&mut module, "main", main_ty.clone());
            let v = b.immediate(Type::Integer, 0);
            b.ret(Some(v));
        }
        let printf = Builder::function(&mut module, "printf", main_ty.clone()).func;
        module.funcs[printf].attrs.is_extern = true;
        {
            let mut b = Builder::function(&mut module, "helper", main_ty);
            let v = b.immediate(Type::Integer, 0);
            b.ret(Some(v));
        }
        apply(&mut module);
        let names: Vec<&str> = module.funcs.iter().map(|(_, f)| f.name.as_str()).collect();
        assert_eq!(names[0], "main");
        assert_eq!(names[1], "printf");
        assert_eq!(names[2], "_XF6helperF7integerE");
    }
}
