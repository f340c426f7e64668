//! Symbol table: struct layout, global labels, function signatures, and
//! the lexically-scoped local-variable stack used to lay out a function's
//! frame during code generation.

use std::collections::HashMap;

use crate::ast::{Function, Program, StructDef, TypeInfo};

/// Where a local/parameter lives relative to the frame pointer, and how
/// large it is.
#[derive(Clone, Debug, PartialEq)]
pub struct LocalSlot {
    pub offset: i16,
    pub type_info: TypeInfo,
}

#[derive(Clone, Debug, PartialEq)]
pub struct FunctionSig {
    pub name: String,
    pub param_types: Vec<TypeInfo>,
    pub return_type: TypeInfo,
}

/// Per-function frame layout: every local and spilled parameter resolved
/// to a frame-pointer-relative offset, plus the computed frame size
/// (bytes to subtract from `SP` after the prologue saves `FP`).
pub struct FrameLayout {
    pub slots: Vec<HashMap<String, LocalSlot>>,
    pub frame_size: u16,
    next_local: i16,
}

impl FrameLayout {
    fn new() -> Self {
        FrameLayout {
            slots: vec![HashMap::new()],
            frame_size: 0,
            next_local: 0,
        }
    }

    pub fn push_scope(&mut self) {
        self.slots.push(HashMap::new());
    }

    pub fn pop_scope(&mut self) {
        self.slots.pop();
    }

    /// Allocates a new local below the current frame, returning its
    /// offset. Negative offsets grow downward from the frame pointer.
    pub fn allocate_local(&mut self, name: &str, type_info: TypeInfo, structs: &HashMap<String, StructDef>) {
        let size = type_info.size_bytes(structs).max(1) as i16;
        self.next_local -= size;
        let offset = self.next_local;
        self.frame_size = self.frame_size.max((-self.next_local) as u16);
        self.slots
            .last_mut()
            .expect("at least one scope")
            .insert(name.to_string(), LocalSlot { offset, type_info });
    }

    /// Registers a parameter already known to live at a fixed offset
    /// (negative for spilled register parameters, positive for
    /// caller-pushed stack parameters).
    pub fn bind_param(&mut self, name: &str, offset: i16, type_info: TypeInfo) {
        if offset < 0 {
            self.frame_size = self.frame_size.max((-offset) as u16);
        }
        self.slots[0].insert(name.to_string(), LocalSlot { offset, type_info });
    }

    pub fn lookup(&self, name: &str) -> Option<&LocalSlot> {
        for scope in self.slots.iter().rev() {
            if let Some(slot) = scope.get(name) {
                return Some(slot);
            }
        }
        None
    }
}

/// Register-passed parameters (index < 4) are spilled to the negative
/// frame-pointer region alongside locals, starting right below the
/// saved frame pointer at `FP-2`. Stack-passed parameters (index >= 4)
/// already live at a positive offset decided by the caller's push
/// order: the return address sits at `FP+2`, so the first stack
/// parameter (index 4) is at `FP+4`, ascending by its size from there.
const REGISTER_PARAM_COUNT: usize = 4;

pub struct SymbolTable {
    pub structs: HashMap<String, StructDef>,
    pub globals: HashMap<String, TypeInfo>,
    pub functions: HashMap<String, FunctionSig>,
}

impl SymbolTable {
    /// Builds the table from a parsed program, computing struct sizes in
    /// declaration order (a struct embedding another by value must be
    /// declared after it, as in ordinary C).
    pub fn build(program: &Program) -> Self {
        let mut structs = HashMap::new();
        for def in &program.structs {
            let mut resolved = def.clone();
            let mut offset = 0u16;
            for (_, ty) in &resolved.fields {
                offset += ty.size_bytes(&structs).max(1);
            }
            resolved.size = offset;
            structs.insert(resolved.name.clone(), resolved);
        }

        let mut globals = HashMap::new();
        for g in &program.globals {
            globals.insert(g.name.clone(), g.type_info.clone());
        }

        let mut functions = HashMap::new();
        for f in &program.functions {
            functions.insert(
                f.name.clone(),
                FunctionSig {
                    name: f.name.clone(),
                    param_types: f.params.iter().map(|p| p.type_info.clone()).collect(),
                    return_type: f.return_type.clone(),
                },
            );
        }

        SymbolTable {
            structs,
            globals,
            functions,
        }
    }

    /// Lays out one function's frame: spills register-passed parameters
    /// into the negative region in declaration order, and binds
    /// caller-pushed parameters to their positive offsets.
    pub fn layout_function(&self, func: &Function) -> FrameLayout {
        let mut layout = FrameLayout::new();
        for (idx, param) in func.params.iter().enumerate() {
            if idx < REGISTER_PARAM_COUNT {
                layout.allocate_local(&param.name, param.type_info.clone(), &self.structs);
            }
        }
        let mut stack_offset: i16 = 4; // FP+2 holds the return address
        for (idx, param) in func.params.iter().enumerate() {
            if idx >= REGISTER_PARAM_COUNT {
                layout.bind_param(&param.name, stack_offset, param.type_info.clone());
                stack_offset += param.type_info.size_bytes(&self.structs).max(1) as i16;
            }
        }
        layout
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{Function, GlobalVar, Param};

    fn int_param(name: &str) -> Param {
        Param {
            name: name.to_string(),
            type_info: TypeInfo::int(),
        }
    }

    #[test]
    fn register_params_spill_to_negative_offsets() {
        let func = Function {
            name: "f".to_string(),
            params: vec![int_param("a"), int_param("b")],
            return_type: TypeInfo::int(),
            body: vec![],
            line: 1,
        };
        let program = Program {
            functions: vec![func.clone()],
            ..Default::default()
        };
        let table = SymbolTable::build(&program);
        let layout = table.layout_function(&func);
        assert_eq!(layout.lookup("a").unwrap().offset, -2);
        assert_eq!(layout.lookup("b").unwrap().offset, -4);
    }

    #[test]
    fn stack_params_start_at_fp_plus_four() {
        let func = Function {
            name: "f".to_string(),
            params: (0..6).map(|i| int_param(&format!("p{i}"))).collect(),
            return_type: TypeInfo::int(),
            body: vec![],
            line: 1,
        };
        let program = Program {
            functions: vec![func.clone()],
            ..Default::default()
        };
        let table = SymbolTable::build(&program);
        let layout = table.layout_function(&func);
        assert_eq!(layout.lookup("p4").unwrap().offset, 4);
        assert_eq!(layout.lookup("p5").unwrap().offset, 6);
    }

    #[test]
    fn struct_size_sums_field_sizes() {
        let program = Program {
            structs: vec![StructDef {
                name: "Point".to_string(),
                fields: vec![
                    ("x".to_string(), TypeInfo::int()),
                    ("y".to_string(), TypeInfo::int()),
                ],
                size: 0,
            }],
            globals: vec![GlobalVar {
                name: "origin".to_string(),
                type_info: TypeInfo::struct_type("Point"),
                init: None,
                line: 1,
            }],
            functions: vec![],
        };
        let table = SymbolTable::build(&program);
        assert_eq!(table.structs["Point"].size, 4);
    }

    #[test]
    fn locals_allocate_downward_from_frame_pointer() {
        let mut layout = FrameLayout::new();
        let structs = HashMap::new();
        layout.allocate_local("a", TypeInfo::int(), &structs);
        layout.allocate_local("b", TypeInfo::char_type(), &structs);
        assert_eq!(layout.lookup("a").unwrap().offset, -2);
        assert_eq!(layout.lookup("b").unwrap().offset, -3);
        assert_eq!(layout.frame_size, 3);
    }
}
