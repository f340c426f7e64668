//! Code generator: walks the AST after dead-function elimination and
//! emits symbolic assembly text consumed by the two-pass assembler.
//!
//! Register convention: `R0` carries the current expression result,
//! `R1` is the scratch register used when popping a pushed operand,
//! `R2` is the frame pointer (saved/restored by every prologue/epilogue),
//! `R6`/`R7` are internal scratch used for frame-size arithmetic and for
//! anything that needs a third register mid-expression (modulo, the
//! zero-test idiom, `print`'s loop cursor). Register-passed call
//! arguments (index 0..3) travel in `R3..R6`; arguments beyond that are
//! pushed by the caller in reverse (highest index first) so index 4
//! lands at `FP+4` in the callee.

use std::collections::{HashMap, HashSet};

use crate::ast::*;
use crate::error::CodegenError;
use crate::symtab::{FrameLayout, SymbolTable};

const REGISTER_ARG_NAMES: [&str; 4] = ["R3", "R4", "R5", "R6"];

pub fn generate(program: &Program) -> Result<String, CodegenError> {
    let reachable = compute_reachable(program);
    let symtab = SymbolTable::build(program);
    let has_isr = reachable.contains("isr");
    let mut gen = CodeGen::new(&symtab);

    gen.emit("    JMP __start");
    gen.emit(".ORG 0x10");
    if has_isr {
        gen.emit("    JMP isr");
    } else {
        gen.emit("    RETI");
    }
    gen.emit("__start:");

    let mut init_globals: Vec<(String, TypeInfo, Expr)> = Vec::new();
    let mut global_defs: Vec<String> = Vec::new();
    for global in &program.globals {
        let words = global.type_info.size_bytes(&symtab.structs).max(1).div_ceil(2);
        match &global.init {
            Some(Expr::InitializerList { .. }) => {
                global_defs.push(format!("{}:", global.name));
                for _ in 0..words {
                    global_defs.push("    .WORD 0".to_string());
                }
                init_globals.push((
                    global.name.clone(),
                    global.type_info.clone(),
                    global.init.clone().unwrap(),
                ));
            }
            Some(expr) => {
                if let Some((value, _)) = const_eval(expr)? {
                    global_defs.push(format!("{}:", global.name));
                    global_defs.push(format!("    .WORD {value}"));
                } else {
                    global_defs.push(format!("{}:", global.name));
                    for _ in 0..words {
                        global_defs.push("    .WORD 0".to_string());
                    }
                    init_globals.push((global.name.clone(), global.type_info.clone(), expr.clone()));
                }
            }
            None => {
                global_defs.push(format!("{}:", global.name));
                for _ in 0..words {
                    global_defs.push("    .WORD 0".to_string());
                }
            }
        }
    }

    if !init_globals.is_empty() {
        gen.emit("    CALL __init");
    }
    gen.emit("    CALL main");
    gen.emit("    HLT");

    if !init_globals.is_empty() {
        gen.emit("__init:");
        for (name, ty, expr) in &init_globals {
            gen.compile_global_init(name, ty, expr)?;
        }
        gen.emit("    RET");
    }

    for func in &program.functions {
        if reachable.contains(&func.name) {
            gen.compile_function(func)?;
        }
    }

    for line in global_defs {
        gen.emit(line);
    }

    Ok(gen.finish())
}

/// Starting from `main` and `isr` (plus any function named in a global
/// initializer), transitively marks every function that can run.
fn compute_reachable(program: &Program) -> HashSet<String> {
    let func_map: HashMap<&str, &Function> = program.functions.iter().map(|f| (f.name.as_str(), f)).collect();
    let mut reachable = HashSet::new();
    let mut frontier: Vec<String> = Vec::new();
    for root in ["main", "isr"] {
        if func_map.contains_key(root) {
            frontier.push(root.to_string());
        }
    }
    for g in &program.globals {
        if let Some(e) = &g.init {
            let mut calls = HashSet::new();
            collect_calls_expr(e, &mut calls);
            for c in calls {
                if func_map.contains_key(c.as_str()) {
                    frontier.push(c);
                }
            }
        }
    }
    while let Some(name) = frontier.pop() {
        if reachable.contains(&name) {
            continue;
        }
        reachable.insert(name.clone());
        if let Some(f) = func_map.get(name.as_str()) {
            let mut calls = HashSet::new();
            for s in &f.body {
                collect_calls_stmt(s, &mut calls);
            }
            for c in calls {
                if !reachable.contains(&c) {
                    frontier.push(c);
                }
            }
        }
    }
    reachable
}

fn collect_calls_expr(expr: &Expr, out: &mut HashSet<String>) {
    match expr {
        Expr::Call { name, args, .. } => {
            out.insert(name.clone());
            for a in args {
                collect_calls_expr(a, out);
            }
        }
        Expr::Unary { expr, .. } | Expr::Cast { expr, .. } | Expr::PostIncDec { expr, .. } => {
            collect_calls_expr(expr, out)
        }
        Expr::Binary { lhs, rhs, .. } | Expr::Logical { lhs, rhs, .. } => {
            collect_calls_expr(lhs, out);
            collect_calls_expr(rhs, out);
        }
        Expr::Assign { target, value, .. } => {
            collect_calls_expr(target, out);
            collect_calls_expr(value, out);
        }
        Expr::Index { base, index, .. } => {
            collect_calls_expr(base, out);
            collect_calls_expr(index, out);
        }
        Expr::Member { base, .. } => collect_calls_expr(base, out),
        Expr::InitializerList { items, .. } => {
            for i in items {
                collect_calls_expr(i, out);
            }
        }
        Expr::IntLiteral { .. } | Expr::CharLiteral { .. } | Expr::StringLiteral { .. } | Expr::VarRef { .. } => {}
    }
}

fn collect_calls_stmt(stmt: &Stmt, out: &mut HashSet<String>) {
    match stmt {
        Stmt::VarDecl { init: Some(e), .. } => collect_calls_expr(e, out),
        Stmt::VarDecl { init: None, .. } => {}
        Stmt::Block(stmts) => {
            for s in stmts {
                collect_calls_stmt(s, out);
            }
        }
        Stmt::If {
            cond,
            then_branch,
            else_branch,
            ..
        } => {
            collect_calls_expr(cond, out);
            collect_calls_stmt(then_branch, out);
            if let Some(e) = else_branch {
                collect_calls_stmt(e, out);
            }
        }
        Stmt::While { cond, body, .. } => {
            collect_calls_expr(cond, out);
            collect_calls_stmt(body, out);
        }
        Stmt::For {
            init,
            cond,
            step,
            body,
            ..
        } => {
            if let Some(i) = init {
                collect_calls_stmt(i, out);
            }
            if let Some(c) = cond {
                collect_calls_expr(c, out);
            }
            if let Some(s) = step {
                collect_calls_expr(s, out);
            }
            collect_calls_stmt(body, out);
        }
        Stmt::Switch { cond, cases, .. } => {
            collect_calls_expr(cond, out);
            for c in cases {
                for s in &c.body {
                    collect_calls_stmt(s, out);
                }
            }
        }
        Stmt::Return { value: Some(e), .. } => collect_calls_expr(e, out),
        Stmt::Return { value: None, .. } => {}
        Stmt::ExprStmt(e) => collect_calls_expr(e, out),
        Stmt::Break(_) | Stmt::Continue(_) | Stmt::Asm { .. } => {}
    }
}

/// Every declared local, regardless of which nested block it lives in,
/// gets its own stack slot; slots are never reclaimed across scopes, so
/// the total frame size is just the sum of every `VarDecl`'s size.
fn prescan_locals_size(body: &[Stmt], structs: &HashMap<String, StructDef>) -> u16 {
    fn walk(stmts: &[Stmt], structs: &HashMap<String, StructDef>, total: &mut u16) {
        for s in stmts {
            match s {
                Stmt::VarDecl { type_info, .. } => *total += type_info.size_bytes(structs).max(1),
                Stmt::Block(inner) => walk(inner, structs, total),
                Stmt::If {
                    then_branch,
                    else_branch,
                    ..
                } => {
                    walk(std::slice::from_ref(then_branch.as_ref()), structs, total);
                    if let Some(e) = else_branch {
                        walk(std::slice::from_ref(e.as_ref()), structs, total);
                    }
                }
                Stmt::While { body, .. } => walk(std::slice::from_ref(body.as_ref()), structs, total),
                Stmt::For { init, body, .. } => {
                    if let Some(i) = init {
                        walk(std::slice::from_ref(i.as_ref()), structs, total);
                    }
                    walk(std::slice::from_ref(body.as_ref()), structs, total);
                }
                Stmt::Switch { cases, .. } => {
                    for c in cases {
                        walk(&c.body, structs, total);
                    }
                }
                _ => {}
            }
        }
    }
    let mut total = 0u16;
    walk(body, structs, &mut total);
    total
}

/// Constant-folds a subtree of integer-valued operators. Returns `Ok(None)`
/// when the expression isn't fully constant (so the caller should fall
/// back to runtime codegen), or an error if a constant division by zero
/// is found. The fold is unsigned iff either operand is unsigned-tagged;
/// add/sub/mul/bitwise share the same bit pattern either way, so only
/// division, modulo, and relational comparisons branch on the tag.
fn const_eval(expr: &Expr) -> Result<Option<(i64, bool)>, CodegenError> {
    match expr {
        Expr::IntLiteral { value, unsigned, .. } => Ok(Some((*value, *unsigned))),
        Expr::CharLiteral { value, .. } => Ok(Some((*value as i64, false))),
        Expr::Unary { op, expr: inner, .. } => {
            let Some((v, u)) = const_eval(inner)? else {
                return Ok(None);
            };
            let v16 = v as u16;
            let result = match op {
                UnaryOp::Neg => (v16 as i16).wrapping_neg() as u16 as i64,
                UnaryOp::BitNot => (!v16) as i64,
                UnaryOp::Not => {
                    if v16 == 0 {
                        1
                    } else {
                        0
                    }
                }
                UnaryOp::AddrOf | UnaryOp::Deref => return Ok(None),
            };
            Ok(Some((result, u)))
        }
        Expr::Binary { op, lhs, rhs, line } => {
            let Some((l, lu)) = const_eval(lhs)? else {
                return Ok(None);
            };
            let Some((r, ru)) = const_eval(rhs)? else {
                return Ok(None);
            };
            let unsigned = lu || ru;
            let a = l as u16;
            let b = r as u16;
            let result = match op {
                BinOp::Add => a.wrapping_add(b) as i64,
                BinOp::Sub => a.wrapping_sub(b) as i64,
                BinOp::Mul => ((a as u32 * b as u32) & 0xFFFF) as i64,
                BinOp::BitAnd => (a & b) as i64,
                BinOp::BitOr => (a | b) as i64,
                BinOp::BitXor => (a ^ b) as i64,
                BinOp::Shl => (((a as u32) << (b & 0xF)) & 0xFFFF) as i64,
                BinOp::Shr => (a >> (b & 0xF)) as i64,
                BinOp::Div => {
                    if unsigned {
                        if b == 0 {
                            return Err(CodegenError::DivByZeroInConstExpr { line: *line });
                        }
                        (a / b) as i64
                    } else {
                        let (a, b) = (a as i16, b as i16);
                        if b == 0 {
                            return Err(CodegenError::DivByZeroInConstExpr { line: *line });
                        }
                        a.wrapping_div(b) as u16 as i64
                    }
                }
                BinOp::Mod => {
                    if unsigned {
                        if b == 0 {
                            return Err(CodegenError::DivByZeroInConstExpr { line: *line });
                        }
                        (a % b) as i64
                    } else {
                        let (a, b) = (a as i16, b as i16);
                        if b == 0 {
                            return Err(CodegenError::DivByZeroInConstExpr { line: *line });
                        }
                        a.wrapping_rem(b) as u16 as i64
                    }
                }
                BinOp::Eq => (a == b) as i64,
                BinOp::Ne => (a != b) as i64,
                BinOp::Lt => {
                    if unsigned {
                        (a < b) as i64
                    } else {
                        ((a as i16) < (b as i16)) as i64
                    }
                }
                BinOp::Gt => {
                    if unsigned {
                        (a > b) as i64
                    } else {
                        ((a as i16) > (b as i16)) as i64
                    }
                }
                BinOp::Le => {
                    if unsigned {
                        (a <= b) as i64
                    } else {
                        ((a as i16) <= (b as i16)) as i64
                    }
                }
                BinOp::Ge => {
                    if unsigned {
                        (a >= b) as i64
                    } else {
                        ((a as i16) >= (b as i16)) as i64
                    }
                }
            };
            let out_unsigned = matches!(
                op,
                BinOp::Add | BinOp::Sub | BinOp::Mul | BinOp::BitAnd | BinOp::BitOr | BinOp::BitXor | BinOp::Shl | BinOp::Shr
            ) && unsigned;
            Ok(Some((result, out_unsigned)))
        }
        _ => Ok(None),
    }
}

fn escape_for_asm(s: &str) -> String {
    let mut out = String::new();
    for c in s.chars() {
        match c {
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\0' => out.push_str("\\0"),
            other => out.push(other),
        }
    }
    out
}

struct CodeGen<'a> {
    symtab: &'a SymbolTable,
    lines: Vec<String>,
    label_counter: usize,
    string_pool: Vec<(String, String)>,
    data_pool: Vec<(String, Vec<i64>)>,
    break_labels: Vec<String>,
    continue_labels: Vec<String>,
    frame: Option<FrameLayout>,
    current_exit_label: Option<String>,
    current_returns_void: bool,
}

impl<'a> CodeGen<'a> {
    fn new(symtab: &'a SymbolTable) -> Self {
        CodeGen {
            symtab,
            lines: Vec::new(),
            label_counter: 0,
            string_pool: Vec::new(),
            data_pool: Vec::new(),
            break_labels: Vec::new(),
            continue_labels: Vec::new(),
            frame: None,
            current_exit_label: None,
            current_returns_void: false,
        }
    }

    fn emit(&mut self, line: impl Into<String>) {
        self.lines.push(line.into());
    }

    fn new_label(&mut self, prefix: &str) -> String {
        self.label_counter += 1;
        format!("__{prefix}{}", self.label_counter)
    }

    fn emit_store(&mut self, addr_reg: &str, value_reg: &str, ty: &TypeInfo) {
        let op = if ty.is_char && !ty.is_array { "STB" } else { "ST" };
        self.emit(format!("    {op} {addr_reg}, {value_reg}"));
    }

    fn emit_load(&mut self, addr_reg: &str, dest_reg: &str, ty: &TypeInfo) {
        let op = if ty.is_char && !ty.is_array { "LDB" } else { "LD" };
        self.emit(format!("    {op} {dest_reg}, {addr_reg}"));
    }

    fn branch_if_zero(&mut self, reg: &str, label: &str) {
        self.emit("    LDI R6, 0");
        self.emit(format!("    ADD R6, {reg}"));
        self.emit(format!("    JZ {label}"));
    }

    fn intern_string(&mut self, value: &str) -> String {
        if let Some((label, _)) = self.string_pool.iter().find(|(_, v)| v == value) {
            return label.clone();
        }
        let label = format!("S{}", self.string_pool.len());
        self.string_pool.push((label.clone(), value.to_string()));
        label
    }

    fn intern_data(&mut self, values: &[i64]) -> String {
        if let Some((label, _)) = self.data_pool.iter().find(|(_, v)| v.as_slice() == values) {
            return label.clone();
        }
        let label = format!("D{}", self.data_pool.len());
        self.data_pool.push((label.clone(), values.to_vec()));
        label
    }

    fn infer_type(&self, expr: &Expr) -> TypeInfo {
        match expr {
            Expr::IntLiteral { unsigned, .. } => {
                if *unsigned {
                    TypeInfo::unsigned_int()
                } else {
                    TypeInfo::int()
                }
            }
            Expr::CharLiteral { .. } => TypeInfo::char_type(),
            Expr::StringLiteral { .. } => TypeInfo::char_type().pointer_to(),
            Expr::VarRef { name, .. } => {
                if let Some(slot) = self.frame.as_ref().and_then(|f| f.lookup(name)) {
                    return slot.type_info.clone();
                }
                self.symtab.globals.get(name).cloned().unwrap_or_else(TypeInfo::int)
            }
            Expr::Unary { op, expr: inner, .. } => match op {
                UnaryOp::AddrOf => self.infer_type(inner).pointer_to(),
                UnaryOp::Deref => self.infer_type(inner).after_index(),
                _ => self.infer_type(inner),
            },
            Expr::Binary { op, lhs, rhs, .. } => {
                let lt = self.infer_type(lhs);
                if lt.pointer_level > 0 && matches!(op, BinOp::Add | BinOp::Sub) {
                    return lt;
                }
                let rt = self.infer_type(rhs);
                if lt.is_unsigned_like() || rt.is_unsigned_like() {
                    TypeInfo::unsigned_int()
                } else {
                    TypeInfo::int()
                }
            }
            Expr::Logical { .. } => TypeInfo::int(),
            Expr::Assign { target, .. } => self.infer_type(target),
            Expr::PostIncDec { expr: inner, .. } => self.infer_type(inner),
            Expr::Call { name, .. } => self
                .symtab
                .functions
                .get(name)
                .map(|s| s.return_type.clone())
                .unwrap_or_else(TypeInfo::int),
            Expr::Cast { type_info, .. } => type_info.clone(),
            Expr::Index { base, .. } => self.infer_type(base).after_index(),
            Expr::Member { base, field, .. } => {
                let base_ty = self.infer_type(base);
                base_ty
                    .struct_name
                    .and_then(|sn| self.symtab.structs.get(&sn))
                    .and_then(|sd| sd.field_offset(field))
                    .map(|(_, ty)| ty)
                    .unwrap_or_else(TypeInfo::int)
            }
            Expr::InitializerList { .. } => TypeInfo::int(),
        }
    }

    /// Leaves the lvalue's address in `R0`.
    fn compile_address(&mut self, expr: &Expr) -> Result<(), CodegenError> {
        match expr {
            Expr::VarRef { name, line } => {
                if let Some(slot) = self.frame.as_ref().and_then(|f| f.lookup(name)).cloned() {
                    self.emit(format!("    LDI R0, {}", slot.offset));
                    self.emit("    ADD R0, R2");
                } else if self.symtab.globals.contains_key(name) {
                    self.emit(format!("    LDI R0, {name}"));
                } else {
                    return Err(CodegenError::UndefinedVariable {
                        line: *line,
                        name: name.clone(),
                    });
                }
                Ok(())
            }
            Expr::Unary {
                op: UnaryOp::Deref,
                expr: inner,
                ..
            } => self.compile_expr_into_r0(inner),
            Expr::Index { base, index, .. } => {
                let base_ty = self.infer_type(base);
                if base_ty.is_array {
                    self.compile_address(base)?;
                } else {
                    self.compile_expr_into_r0(base)?;
                }
                self.emit("    PUSH R0");
                self.compile_expr_into_r0(index)?;
                let stride = base_ty.element_size(&self.symtab.structs);
                if stride != 1 {
                    self.emit(format!("    LDI R1, {stride}"));
                    self.emit("    MUL R0, R1");
                }
                self.emit("    POP R1");
                self.emit("    ADD R0, R1");
                Ok(())
            }
            Expr::Member { base, field, arrow, line } => {
                if *arrow {
                    self.compile_expr_into_r0(base)?;
                } else {
                    self.compile_address(base)?;
                }
                let base_ty = self.infer_type(base);
                let struct_name = base_ty.struct_name.clone().ok_or_else(|| CodegenError::UnknownStruct {
                    line: *line,
                    name: field.clone(),
                })?;
                let def = self
                    .symtab
                    .structs
                    .get(&struct_name)
                    .ok_or_else(|| CodegenError::UnknownStruct {
                        line: *line,
                        name: struct_name.clone(),
                    })?;
                let (offset, _) = def.field_offset(field).ok_or_else(|| CodegenError::UnknownField {
                    line: *line,
                    name: struct_name.clone(),
                    field: field.clone(),
                })?;
                if offset != 0 {
                    self.emit(format!("    LDI R1, {offset}"));
                    self.emit("    ADD R0, R1");
                }
                Ok(())
            }
            other => self.compile_expr_into_r0(other),
        }
    }

    fn compile_expr_into_r0(&mut self, expr: &Expr) -> Result<(), CodegenError> {
        if matches!(
            expr,
            Expr::Binary {
                op: BinOp::Add | BinOp::Sub | BinOp::Mul | BinOp::BitAnd | BinOp::BitOr | BinOp::BitXor | BinOp::Shl | BinOp::Shr,
                ..
            }
        ) {
            if let Some((value, _)) = const_eval(expr)? {
                self.emit(format!("    LDI R0, {value}"));
                return Ok(());
            }
        }
        match expr {
            Expr::IntLiteral { value, .. } => {
                self.emit(format!("    LDI R0, {value}"));
                Ok(())
            }
            Expr::CharLiteral { value, .. } => {
                self.emit(format!("    LDI R0, {value}"));
                Ok(())
            }
            Expr::StringLiteral { value, .. } => {
                let label = self.intern_string(value);
                self.emit(format!("    LDI R0, {label}"));
                Ok(())
            }
            Expr::VarRef { .. } => {
                let ty = self.infer_type(expr);
                self.compile_address(expr)?;
                if !ty.is_array {
                    self.emit_load("R0", "R0", &ty);
                }
                Ok(())
            }
            Expr::Unary { op, expr: inner, .. } => self.compile_unary(*op, inner),
            Expr::Binary { op, lhs, rhs, .. } => self.compile_binary(*op, lhs, rhs),
            Expr::Logical { op, lhs, rhs, .. } => self.compile_logical(*op, lhs, rhs),
            Expr::Assign { op, target, value, .. } => self.compile_assign(*op, target, value),
            Expr::PostIncDec { op, expr: inner, .. } => self.compile_post_inc_dec(*op, inner),
            Expr::Call { name, args, .. } => self.compile_call(name, args),
            Expr::Cast { expr: inner, .. } => self.compile_expr_into_r0(inner),
            Expr::Index { .. } => {
                let ty = self.infer_type(expr);
                self.compile_address(expr)?;
                if !ty.is_array {
                    self.emit_load("R0", "R0", &ty);
                }
                Ok(())
            }
            Expr::Member { .. } => {
                let ty = self.infer_type(expr);
                self.compile_address(expr)?;
                if !ty.is_array {
                    self.emit_load("R0", "R0", &ty);
                }
                Ok(())
            }
            Expr::InitializerList { items, .. } => {
                if let Some(first) = items.first() {
                    self.compile_expr_into_r0(first)
                } else {
                    self.emit("    LDI R0, 0");
                    Ok(())
                }
            }
        }
    }

    fn compile_unary(&mut self, op: UnaryOp, inner: &Expr) -> Result<(), CodegenError> {
        match op {
            UnaryOp::AddrOf => self.compile_address(inner),
            UnaryOp::Deref => {
                let ty = self.infer_type(inner).after_index();
                self.compile_expr_into_r0(inner)?;
                self.emit_load("R0", "R0", &ty);
                Ok(())
            }
            UnaryOp::Neg => {
                self.compile_expr_into_r0(inner)?;
                self.emit("    MOV R1, R0");
                self.emit("    LDI R0, 0");
                self.emit("    SUB R0, R1");
                Ok(())
            }
            UnaryOp::BitNot => {
                self.compile_expr_into_r0(inner)?;
                self.emit("    NOT R0");
                Ok(())
            }
            UnaryOp::Not => {
                self.compile_expr_into_r0(inner)?;
                let true_label = self.new_label("NOTTRUE");
                let end_label = self.new_label("NOTEND");
                self.branch_if_zero("R0", &true_label);
                self.emit("    LDI R0, 0");
                self.emit(format!("    JMP {end_label}"));
                self.emit(format!("{true_label}:"));
                self.emit("    LDI R0, 1");
                self.emit(format!("{end_label}:"));
                Ok(())
            }
        }
    }

    fn compile_binary(&mut self, op: BinOp, lhs: &Expr, rhs: &Expr) -> Result<(), CodegenError> {
        if let Some((value, _)) = const_eval(&Expr::Binary {
            op,
            lhs: Box::new(lhs.clone()),
            rhs: Box::new(rhs.clone()),
            line: lhs.line(),
        })? {
            self.emit(format!("    LDI R0, {value}"));
            return Ok(());
        }
        match op {
            BinOp::Lt | BinOp::Gt | BinOp::Le | BinOp::Ge => return self.compile_relational(op, lhs, rhs),
            BinOp::Eq | BinOp::Ne => return self.compile_equality(op, lhs, rhs),
            _ => {}
        }
        self.compile_expr_into_r0(lhs)?;
        self.emit("    PUSH R0");
        self.compile_expr_into_r0(rhs)?;
        self.emit("    POP R1");
        // R1 = lhs, R0 = rhs
        match op {
            BinOp::Add => {
                self.emit("    ADD R1, R0");
                self.emit("    MOV R0, R1");
            }
            BinOp::Sub => {
                self.emit("    SUB R1, R0");
                self.emit("    MOV R0, R1");
            }
            BinOp::Mul => {
                self.emit("    MUL R1, R0");
                self.emit("    MOV R0, R1");
            }
            BinOp::BitAnd => {
                self.emit("    AND R1, R0");
                self.emit("    MOV R0, R1");
            }
            BinOp::BitOr => {
                self.emit("    OR R1, R0");
                self.emit("    MOV R0, R1");
            }
            BinOp::BitXor => {
                self.emit("    XOR R1, R0");
                self.emit("    MOV R0, R1");
            }
            BinOp::Shl => {
                self.emit("    SHL R1, R0");
                self.emit("    MOV R0, R1");
            }
            BinOp::Shr => {
                self.emit("    SHR R1, R0");
                self.emit("    MOV R0, R1");
            }
            BinOp::Div => {
                let signed = !(self.infer_type(lhs).is_unsigned_like() || self.infer_type(rhs).is_unsigned_like());
                let mnemonic = if signed { "IDIV" } else { "DIV" };
                self.emit(format!("    {mnemonic} R1, R0"));
                self.emit("    MOV R0, R1");
            }
            BinOp::Mod => {
                let signed = !(self.infer_type(lhs).is_unsigned_like() || self.infer_type(rhs).is_unsigned_like());
                let mnemonic = if signed { "IDIV" } else { "DIV" };
                self.emit("    MOV R6, R1");
                self.emit(format!("    {mnemonic} R1, R0"));
                self.emit("    MUL R1, R0");
                self.emit("    SUB R6, R1");
                self.emit("    MOV R0, R6");
            }
            BinOp::Eq | BinOp::Ne | BinOp::Lt | BinOp::Gt | BinOp::Le | BinOp::Ge => unreachable!(),
        }
        Ok(())
    }

    fn compile_relational(&mut self, op: BinOp, lhs: &Expr, rhs: &Expr) -> Result<(), CodegenError> {
        let signed = !(self.infer_type(lhs).is_unsigned_like() || self.infer_type(rhs).is_unsigned_like());
        let (a, b, negate): (&Expr, &Expr, bool) = match op {
            BinOp::Lt => (lhs, rhs, false),
            BinOp::Gt => (rhs, lhs, false),
            BinOp::Le => (rhs, lhs, true),
            BinOp::Ge => (lhs, rhs, true),
            _ => unreachable!(),
        };
        self.compile_expr_into_r0(a)?;
        self.emit("    PUSH R0");
        self.compile_expr_into_r0(b)?;
        self.emit("    POP R1");
        self.emit("    SUB R1, R0");
        let true_label = self.new_label("LT");
        let end_label = self.new_label("LTEND");
        let branch = if signed { "JN" } else { "JC" };
        self.emit(format!("    {branch} {true_label}"));
        self.emit(format!("    LDI R0, {}", if negate { 1 } else { 0 }));
        self.emit(format!("    JMP {end_label}"));
        self.emit(format!("{true_label}:"));
        self.emit(format!("    LDI R0, {}", if negate { 0 } else { 1 }));
        self.emit(format!("{end_label}:"));
        Ok(())
    }

    fn compile_equality(&mut self, op: BinOp, lhs: &Expr, rhs: &Expr) -> Result<(), CodegenError> {
        self.compile_expr_into_r0(lhs)?;
        self.emit("    PUSH R0");
        self.compile_expr_into_r0(rhs)?;
        self.emit("    POP R1");
        self.emit("    SUB R1, R0");
        let true_label = self.new_label("EQ");
        let end_label = self.new_label("EQEND");
        let branch = if op == BinOp::Eq { "JZ" } else { "JNZ" };
        self.emit(format!("    {branch} {true_label}"));
        self.emit("    LDI R0, 0");
        self.emit(format!("    JMP {end_label}"));
        self.emit(format!("{true_label}:"));
        self.emit("    LDI R0, 1");
        self.emit(format!("{end_label}:"));
        Ok(())
    }

    fn compile_logical(&mut self, op: LogicalOp, lhs: &Expr, rhs: &Expr) -> Result<(), CodegenError> {
        let short_circuit_label = self.new_label(if op == LogicalOp::And { "ANDSHORT" } else { "ORSHORT" });
        let end_label = self.new_label(if op == LogicalOp::And { "ANDEND" } else { "OREND" });
        self.compile_expr_into_r0(lhs)?;
        match op {
            LogicalOp::And => self.branch_if_zero("R0", &short_circuit_label),
            LogicalOp::Or => {
                let true_label = self.new_label("ORTRUE");
                self.emit("    LDI R6, 0");
                self.emit("    ADD R6, R0");
                self.emit(format!("    JNZ {true_label}"));
                self.compile_expr_into_r0(rhs)?;
                self.emit("    LDI R6, 0");
                self.emit("    ADD R6, R0");
                self.emit(format!("    JNZ {true_label}"));
                self.emit(format!("    JMP {short_circuit_label}"));
                self.emit(format!("{true_label}:"));
                self.emit("    LDI R0, 1");
                self.emit(format!("    JMP {end_label}"));
                self.emit(format!("{short_circuit_label}:"));
                self.emit("    LDI R0, 0");
                self.emit(format!("{end_label}:"));
                return Ok(());
            }
        }
        self.compile_expr_into_r0(rhs)?;
        self.branch_if_zero("R0", &short_circuit_label);
        self.emit("    LDI R0, 1");
        self.emit(format!("    JMP {end_label}"));
        self.emit(format!("{short_circuit_label}:"));
        self.emit("    LDI R0, 0");
        self.emit(format!("{end_label}:"));
        Ok(())
    }

    fn compile_assign(&mut self, op: AssignOp, target: &Expr, value: &Expr) -> Result<(), CodegenError> {
        let ty = self.infer_type(target);
        self.compile_address(target)?;
        self.emit("    PUSH R0");
        if op == AssignOp::Assign {
            self.compile_expr_into_r0(value)?;
        } else {
            self.emit_load("R0", "R0", &ty);
            self.emit("    PUSH R0");
            self.compile_expr_into_r0(value)?;
            self.emit("    POP R1");
            match op {
                AssignOp::AddAssign => self.emit("    ADD R1, R0"),
                AssignOp::SubAssign => self.emit("    SUB R1, R0"),
                AssignOp::MulAssign => self.emit("    MUL R1, R0"),
                AssignOp::DivAssign => {
                    let signed = !ty.is_unsigned_like();
                    let mnemonic = if signed { "IDIV" } else { "DIV" };
                    self.emit(format!("    {mnemonic} R1, R0"));
                }
                AssignOp::Assign => unreachable!(),
            }
            self.emit("    MOV R0, R1");
        }
        self.emit("    POP R1");
        self.emit_store("R1", "R0", &ty);
        Ok(())
    }

    fn compile_post_inc_dec(&mut self, op: IncDecOp, inner: &Expr) -> Result<(), CodegenError> {
        let ty = self.infer_type(inner);
        self.compile_address(inner)?;
        self.emit("    PUSH R0");
        self.emit_load("R0", "R0", &ty);
        self.emit("    MOV R6, R0");
        self.emit("    MOV R1, R0");
        self.emit("    LDI R0, 1");
        match op {
            IncDecOp::Inc => self.emit("    ADD R1, R0"),
            IncDecOp::Dec => self.emit("    SUB R1, R0"),
        }
        self.emit("    MOV R0, R1");
        self.emit("    POP R1");
        self.emit_store("R1", "R0", &ty);
        self.emit("    MOV R0, R6");
        Ok(())
    }

    fn compile_call(&mut self, name: &str, args: &[Expr]) -> Result<(), CodegenError> {
        if name == "print" {
            return self.compile_print(&args[0]);
        }
        if name == "print_packed" {
            return self.compile_print_packed(&args[0]);
        }
        let line = args.first().map(|a| a.line()).unwrap_or(0);
        if !self.symtab.functions.contains_key(name) {
            return Err(CodegenError::UndefinedFunction {
                line,
                name: name.to_string(),
            });
        }
        for arg in args.iter().enumerate().skip(4).rev().map(|(_, a)| a) {
            self.compile_expr_into_r0(arg)?;
            self.emit("    PUSH R0");
        }
        // Register-passed arguments are evaluated left-to-right onto the
        // stack first, then popped into their registers right before the
        // call. Moving a computed value straight into R3..R6 one argument
        // at a time would let a later argument's own nested call clobber
        // an earlier argument already sitting in one of those registers.
        let reg_arg_count = args.len().min(4);
        for arg in args.iter().take(reg_arg_count) {
            self.compile_expr_into_r0(arg)?;
            self.emit("    PUSH R0");
        }
        for idx in (0..reg_arg_count).rev() {
            self.emit(format!("    POP {}", REGISTER_ARG_NAMES[idx]));
        }
        self.emit(format!("    CALL {name}"));
        if args.len() > 4 {
            for _ in 0..(args.len() - 4) {
                self.emit("    POP R1");
            }
        }
        Ok(())
    }

    fn compile_print(&mut self, ptr: &Expr) -> Result<(), CodegenError> {
        self.compile_expr_into_r0(ptr)?;
        let loop_label = self.new_label("PRLOOP");
        let end_label = self.new_label("PREND");
        self.emit(format!("{loop_label}:"));
        self.emit("    LDB R1, R0");
        self.branch_if_zero("R1", &end_label);
        self.emit("    LDI R7, 0xFF00");
        self.emit("    ST R7, R1");
        self.emit("    LDI R7, 1");
        self.emit("    ADD R0, R7");
        self.emit(format!("    JMP {loop_label}"));
        self.emit(format!("{end_label}:"));
        Ok(())
    }

    fn compile_print_packed(&mut self, ptr: &Expr) -> Result<(), CodegenError> {
        self.compile_expr_into_r0(ptr)?;
        let loop_label = self.new_label("PPLOOP");
        let end_label = self.new_label("PPEND");
        self.emit(format!("{loop_label}:"));
        self.emit("    LD R1, R0");
        self.emit("    MOV R6, R1");
        self.branch_if_zero("R6", &end_label);
        self.emit("    LDI R7, 0xFF00");
        self.emit("    ST R7, R1");
        self.emit("    LDI R5, 8");
        self.emit("    SHR R1, R5");
        self.emit("    LDI R7, 0xFF00");
        self.emit("    ST R7, R1");
        self.emit("    LDI R7, 2");
        self.emit("    ADD R0, R7");
        self.emit(format!("    JMP {loop_label}"));
        self.emit(format!("{end_label}:"));
        Ok(())
    }

    fn compile_local_init(&mut self, name: &str, ty: &TypeInfo, init: &Expr) -> Result<(), CodegenError> {
        if let Expr::InitializerList { items, .. } = init {
            return self.compile_local_array_init(name, ty, items);
        }
        self.compile_expr_into_r0(init)?;
        self.emit("    MOV R1, R0");
        let offset = self.frame.as_ref().unwrap().lookup(name).unwrap().offset;
        self.emit(format!("    LDI R0, {offset}"));
        self.emit("    ADD R0, R2");
        self.emit_store("R0", "R1", ty);
        Ok(())
    }

    fn compile_local_array_init(&mut self, name: &str, ty: &TypeInfo, items: &[Expr]) -> Result<(), CodegenError> {
        let elem_ty = ty.after_index();
        let offset = self.frame.as_ref().unwrap().lookup(name).unwrap().offset;
        let mut consts = Vec::with_capacity(items.len());
        let mut all_const = true;
        for item in items {
            match const_eval(item)? {
                Some((v, _)) => consts.push(v),
                None => {
                    all_const = false;
                    break;
                }
            }
        }
        if all_const && !elem_ty.is_char {
            let label = self.intern_data(&consts);
            self.emit(format!("    LDI R0, {label}"));
            self.emit(format!("    LDI R1, {offset}"));
            self.emit("    ADD R1, R2");
            self.emit(format!("    LDI R6, {}", consts.len()));
            self.emit("    COPY R0, R1, R6");
            return Ok(());
        }
        let stride = elem_ty.size_bytes(&self.symtab.structs).max(1) as i64;
        for (i, item) in items.iter().enumerate() {
            self.compile_expr_into_r0(item)?;
            self.emit("    MOV R1, R0");
            self.emit(format!("    LDI R0, {}", offset as i64 + i as i64 * stride));
            self.emit("    ADD R0, R2");
            self.emit_store("R0", "R1", &elem_ty);
        }
        Ok(())
    }

    fn compile_global_init(&mut self, name: &str, ty: &TypeInfo, init: &Expr) -> Result<(), CodegenError> {
        if let Expr::InitializerList { items, .. } = init {
            let elem_ty = ty.after_index();
            let stride = elem_ty.size_bytes(&self.symtab.structs).max(1);
            for (i, item) in items.iter().enumerate() {
                self.compile_expr_into_r0(item)?;
                self.emit("    MOV R1, R0");
                self.emit(format!("    LDI R0, {name}"));
                if i > 0 {
                    self.emit(format!("    LDI R7, {}", i as u16 * stride));
                    self.emit("    ADD R0, R7");
                }
                self.emit_store("R0", "R1", &elem_ty);
            }
            return Ok(());
        }
        self.compile_expr_into_r0(init)?;
        self.emit("    MOV R1, R0");
        self.emit(format!("    LDI R0, {name}"));
        self.emit_store("R0", "R1", ty);
        Ok(())
    }

    fn compile_stmt(&mut self, stmt: &Stmt) -> Result<(), CodegenError> {
        match stmt {
            Stmt::VarDecl { name, type_info, init, .. } => {
                self.frame
                    .as_mut()
                    .expect("statements only compile inside a function")
                    .allocate_local(name, type_info.clone(), &self.symtab.structs);
                if let Some(init_expr) = init {
                    self.compile_local_init(name, type_info, init_expr)?;
                }
                Ok(())
            }
            Stmt::Block(stmts) => {
                self.frame.as_mut().unwrap().push_scope();
                for s in stmts {
                    self.compile_stmt(s)?;
                }
                self.frame.as_mut().unwrap().pop_scope();
                Ok(())
            }
            Stmt::If {
                cond,
                then_branch,
                else_branch,
                ..
            } => {
                self.compile_expr_into_r0(cond)?;
                let else_label = self.new_label("ELSE");
                let end_label = self.new_label("ENDIF");
                self.branch_if_zero("R0", &else_label);
                self.compile_stmt(then_branch)?;
                self.emit(format!("    JMP {end_label}"));
                self.emit(format!("{else_label}:"));
                if let Some(eb) = else_branch {
                    self.compile_stmt(eb)?;
                }
                self.emit(format!("{end_label}:"));
                Ok(())
            }
            Stmt::While { cond, body, .. } => {
                let start_label = self.new_label("WSTART");
                let end_label = self.new_label("WEND");
                self.emit(format!("{start_label}:"));
                self.compile_expr_into_r0(cond)?;
                self.branch_if_zero("R0", &end_label);
                self.break_labels.push(end_label.clone());
                self.continue_labels.push(start_label.clone());
                self.compile_stmt(body)?;
                self.break_labels.pop();
                self.continue_labels.pop();
                self.emit(format!("    JMP {start_label}"));
                self.emit(format!("{end_label}:"));
                Ok(())
            }
            Stmt::For {
                init,
                cond,
                step,
                body,
                ..
            } => {
                self.frame.as_mut().unwrap().push_scope();
                if let Some(i) = init {
                    self.compile_stmt(i)?;
                }
                let start_label = self.new_label("FSTART");
                let step_label = self.new_label("FSTEP");
                let end_label = self.new_label("FEND");
                self.emit(format!("{start_label}:"));
                if let Some(c) = cond {
                    self.compile_expr_into_r0(c)?;
                    self.branch_if_zero("R0", &end_label);
                }
                self.break_labels.push(end_label.clone());
                self.continue_labels.push(step_label.clone());
                self.compile_stmt(body)?;
                self.break_labels.pop();
                self.continue_labels.pop();
                self.emit(format!("{step_label}:"));
                if let Some(s) = step {
                    self.compile_expr_into_r0(s)?;
                }
                self.emit(format!("    JMP {start_label}"));
                self.emit(format!("{end_label}:"));
                self.frame.as_mut().unwrap().pop_scope();
                Ok(())
            }
            Stmt::Switch { cond, cases, .. } => {
                self.compile_expr_into_r0(cond)?;
                self.emit("    MOV R5, R0");
                let end_label = self.new_label("SWEND");
                let mut case_labels = Vec::with_capacity(cases.len());
                for case in cases {
                    let label = self.new_label("CASE");
                    if let Some(v) = case.value {
                        self.emit(format!("    LDI R6, {v}"));
                        self.emit("    MOV R7, R5");
                        self.emit("    SUB R7, R6");
                        self.emit(format!("    JZ {label}"));
                    }
                    case_labels.push(label);
                }
                if let Some(default_idx) = cases.iter().position(|c| c.value.is_none()) {
                    self.emit(format!("    JMP {}", case_labels[default_idx]));
                } else {
                    self.emit(format!("    JMP {end_label}"));
                }
                self.break_labels.push(end_label.clone());
                for (case, label) in cases.iter().zip(case_labels.iter()) {
                    self.emit(format!("{label}:"));
                    for s in &case.body {
                        self.compile_stmt(s)?;
                    }
                }
                self.break_labels.pop();
                self.emit(format!("{end_label}:"));
                Ok(())
            }
            Stmt::Return { value, line } => {
                match (self.current_returns_void, value) {
                    (true, Some(_)) => return Err(CodegenError::VoidFunctionReturnsValue { line: *line }),
                    (false, None) => return Err(CodegenError::MissingReturnValue { line: *line }),
                    _ => {}
                }
                if let Some(v) = value {
                    self.compile_expr_into_r0(v)?;
                }
                let exit_label = self.current_exit_label.clone().expect("return outside a function");
                self.emit(format!("    JMP {exit_label}"));
                Ok(())
            }
            Stmt::ExprStmt(e) => self.compile_expr_into_r0(e),
            Stmt::Break(line) => {
                let label = self
                    .break_labels
                    .last()
                    .cloned()
                    .ok_or(CodegenError::BreakOutsideLoop { line: *line })?;
                self.emit(format!("    JMP {label}"));
                Ok(())
            }
            Stmt::Continue(line) => {
                let label = self
                    .continue_labels
                    .last()
                    .cloned()
                    .ok_or(CodegenError::ContinueOutsideLoop { line: *line })?;
                self.emit(format!("    JMP {label}"));
                Ok(())
            }
            Stmt::Asm { body, .. } => {
                for line in body.lines() {
                    self.emit(line.to_string());
                }
                Ok(())
            }
        }
    }

    fn compile_function(&mut self, func: &Function) -> Result<(), CodegenError> {
        let layout = self.symtab.layout_function(func);
        let extra = prescan_locals_size(&func.body, &self.symtab.structs);
        let frame_size = layout.frame_size + extra;
        self.frame = Some(layout);
        let exit_label = format!("__exit_{}", func.name);
        self.current_exit_label = Some(exit_label.clone());
        self.current_returns_void = func.return_type.is_void;

        self.emit(format!("{}:", func.name));
        self.emit("    PUSH R2");
        self.emit("    LDSP R2");
        self.emit("    LDSP R7");
        if frame_size > 0 {
            // R1, not R6: R6 is the 4th register-argument slot, and the
            // param-spill loop right below still needs to read it.
            self.emit(format!("    LDI R1, {frame_size}"));
            self.emit("    SUB R7, R1");
        }
        self.emit("    STSP R7");

        for (idx, param) in func.params.iter().enumerate().take(4) {
            let slot = self.frame.as_ref().unwrap().lookup(&param.name).unwrap().clone();
            self.emit(format!("    LDI R1, {}", slot.offset));
            self.emit("    ADD R1, R2");
            self.emit_store("R1", REGISTER_ARG_NAMES[idx], &slot.type_info);
        }

        for stmt in &func.body {
            self.compile_stmt(stmt)?;
        }

        self.emit(format!("{exit_label}:"));
        self.emit("    STSP R2");
        self.emit("    POP R2");
        if func.name == "isr" {
            self.emit("    RETI");
        } else {
            self.emit("    RET");
        }
        self.frame = None;
        self.current_exit_label = None;
        Ok(())
    }

    fn finish(mut self) -> String {
        for (label, value) in &self.string_pool {
            self.lines.push(format!("{label}:"));
            self.lines.push(format!("    .STRING \"{}\"", escape_for_asm(value)));
        }
        for (label, values) in &self.data_pool {
            self.lines.push(format!("{label}:"));
            for v in values {
                self.lines.push(format!("    .WORD {v}"));
            }
        }
        let mut out = self.lines.join("\n");
        out.push('\n');
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assembler::assemble;
    use crate::lexer::tokenize;
    use crate::parser::parse;

    fn compile(src: &str) -> String {
        let tokens = tokenize(src).unwrap();
        let program = parse(tokens).unwrap();
        generate(&program).unwrap()
    }

    #[test]
    fn fibonacci_program_assembles_cleanly() {
        let asm = compile(
            "int fib(int n){if(n==0)return 0;if(n==1)return 1;return fib(n-1)+fib(n-2);} \
             int main(){int x; x=fib(6); return x;}",
        );
        assemble(&asm).unwrap();
    }

    #[test]
    fn unreachable_function_is_dropped() {
        let asm = compile("int dead(){return 1;} int main(){return 0;}");
        assert!(!asm.contains("dead:"));
    }

    #[test]
    fn constant_division_folds_to_single_load() {
        let asm = compile("int main(){unsigned int x=0xFFF6; return x/2;}");
        assemble(&asm).unwrap();
    }

    #[test]
    fn dead_function_elimination_is_idempotent() {
        let tokens = tokenize("int dead(){return 1;} int main(){return 0;}").unwrap();
        let program = parse(tokens).unwrap();
        let first = compute_reachable(&program);
        let second = compute_reachable(&program);
        assert_eq!(first, second);
        assert!(first.contains("main"));
        assert!(!first.contains("dead"));
    }

    #[test]
    fn break_outside_loop_is_an_error() {
        let tokens = tokenize("int main(){break; return 0;}").unwrap();
        let program = parse(tokens).unwrap();
        let err = generate(&program).unwrap_err();
        assert!(matches!(err, CodegenError::BreakOutsideLoop { .. }));
    }

    #[test]
    fn void_function_returning_a_value_is_an_error() {
        let tokens = tokenize("void f(){return 1;} int main(){f(); return 0;}").unwrap();
        let program = parse(tokens).unwrap();
        let err = generate(&program).unwrap_err();
        assert!(matches!(err, CodegenError::VoidFunctionReturnsValue { .. }));
    }

    #[test]
    fn non_void_function_with_bare_return_is_an_error() {
        let tokens = tokenize("int f(){return;} int main(){return f();}").unwrap();
        let program = parse(tokens).unwrap();
        let err = generate(&program).unwrap_err();
        assert!(matches!(err, CodegenError::MissingReturnValue { .. }));
    }
}
