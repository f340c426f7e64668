//! Shared AST and type-info definitions produced by the parser and
//! consumed by the symbol table and code generator.

use std::collections::HashMap;

/// Static type information carried by every declared variable, parameter,
/// struct field, and function return type.
#[derive(Clone, Debug, PartialEq, Default)]
pub struct TypeInfo {
    pub is_array: bool,
    pub array_sizes: Vec<usize>,
    pub is_struct: bool,
    pub struct_name: Option<String>,
    pub is_char: bool,
    pub pointer_level: usize,
    pub is_unsigned: bool,
    pub is_void: bool,
}

impl TypeInfo {
    pub fn int() -> Self {
        TypeInfo::default()
    }

    pub fn unsigned_int() -> Self {
        TypeInfo {
            is_unsigned: true,
            ..Default::default()
        }
    }

    pub fn char_type() -> Self {
        TypeInfo {
            is_char: true,
            ..Default::default()
        }
    }

    pub fn void() -> Self {
        TypeInfo {
            is_void: true,
            ..Default::default()
        }
    }

    pub fn struct_type(name: &str) -> Self {
        TypeInfo {
            is_struct: true,
            struct_name: Some(name.to_string()),
            ..Default::default()
        }
    }

    pub fn pointer_to(mut self) -> Self {
        self.pointer_level += 1;
        self
    }

    pub fn array_of(mut self, size: usize) -> Self {
        self.is_array = true;
        self.array_sizes.push(size);
        self
    }

    /// Size in bytes of one *element* when this type is indexed (an
    /// array) or dereferenced (a pointer). Pointers-to-char step by one
    /// byte; everything else steps by a 16-bit word or a struct's full
    /// size.
    pub fn element_size(&self, structs: &HashMap<String, StructDef>) -> u16 {
        if self.pointer_level > 1 {
            return 2;
        }
        if self.is_struct {
            return structs.get(self.struct_name.as_deref().unwrap_or("")).map(|s| s.size).unwrap_or(2);
        }
        if self.is_char && self.pointer_level <= 1 {
            return 1;
        }
        2
    }

    /// Total size in bytes this type occupies in storage (a local slot,
    /// a global, or a struct field).
    pub fn size_bytes(&self, structs: &HashMap<String, StructDef>) -> u16 {
        if self.pointer_level > 0 {
            let base = if self.is_array {
                2 * self.array_sizes.iter().product::<usize>().max(1) as u16
            } else {
                2
            };
            return base;
        }
        let elem = if self.is_struct {
            structs.get(self.struct_name.as_deref().unwrap_or("")).map(|s| s.size).unwrap_or(2)
        } else if self.is_char {
            1
        } else {
            2
        };
        if self.is_array {
            let count: u16 = self.array_sizes.iter().product::<usize>().max(1) as u16;
            elem * count
        } else {
            elem
        }
    }

    /// The type obtained after one level of indexing (`a[i]`): drops the
    /// outermost array dimension, or strips one pointer level if this is
    /// a bare pointer (not an array).
    pub fn after_index(&self) -> TypeInfo {
        let mut t = self.clone();
        if self.is_array && self.array_sizes.len() > 1 {
            t.array_sizes.remove(0);
        } else if self.is_array {
            t.is_array = false;
            t.array_sizes.clear();
        } else if self.pointer_level > 0 {
            t.pointer_level -= 1;
        }
        t
    }

    pub fn is_unsigned_like(&self) -> bool {
        self.is_unsigned || self.pointer_level > 0
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct StructDef {
    pub name: String,
    pub fields: Vec<(String, TypeInfo)>,
    pub size: u16,
}

impl StructDef {
    pub fn field_offset(&self, name: &str) -> Option<(u16, TypeInfo)> {
        let mut offset = 0u16;
        for (fname, ty) in &self.fields {
            if fname == name {
                return Some((offset, ty.clone()));
            }
            offset += ty.size_bytes(&HashMap::new()).max(1);
        }
        None
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    BitAnd,
    BitOr,
    BitXor,
    Shl,
    Shr,
    Eq,
    Ne,
    Lt,
    Gt,
    Le,
    Ge,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogicalOp {
    And,
    Or,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Not,
    BitNot,
    AddrOf,
    Deref,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AssignOp {
    Assign,
    AddAssign,
    SubAssign,
    MulAssign,
    DivAssign,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IncDecOp {
    Inc,
    Dec,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Expr {
    IntLiteral { value: i64, unsigned: bool, line: usize },
    CharLiteral { value: u8, line: usize },
    StringLiteral { value: String, line: usize },
    VarRef { name: String, line: usize },
    Unary { op: UnaryOp, expr: Box<Expr>, line: usize },
    Binary { op: BinOp, lhs: Box<Expr>, rhs: Box<Expr>, line: usize },
    Logical { op: LogicalOp, lhs: Box<Expr>, rhs: Box<Expr>, line: usize },
    Assign { op: AssignOp, target: Box<Expr>, value: Box<Expr>, line: usize },
    PostIncDec { op: IncDecOp, expr: Box<Expr>, line: usize },
    Call { name: String, args: Vec<Expr>, line: usize },
    Cast { type_info: TypeInfo, expr: Box<Expr>, line: usize },
    Index { base: Box<Expr>, index: Box<Expr>, line: usize },
    Member { base: Box<Expr>, field: String, arrow: bool, line: usize },
    InitializerList { items: Vec<Expr>, line: usize },
}

impl Expr {
    pub fn line(&self) -> usize {
        match self {
            Expr::IntLiteral { line, .. }
            | Expr::CharLiteral { line, .. }
            | Expr::StringLiteral { line, .. }
            | Expr::VarRef { line, .. }
            | Expr::Unary { line, .. }
            | Expr::Binary { line, .. }
            | Expr::Logical { line, .. }
            | Expr::Assign { line, .. }
            | Expr::PostIncDec { line, .. }
            | Expr::Call { line, .. }
            | Expr::Cast { line, .. }
            | Expr::Index { line, .. }
            | Expr::Member { line, .. }
            | Expr::InitializerList { line, .. } => *line,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Param {
    pub name: String,
    pub type_info: TypeInfo,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Stmt {
    VarDecl { name: String, type_info: TypeInfo, init: Option<Expr>, line: usize },
    Block(Vec<Stmt>),
    If { cond: Expr, then_branch: Box<Stmt>, else_branch: Option<Box<Stmt>>, line: usize },
    While { cond: Expr, body: Box<Stmt>, line: usize },
    For {
        init: Option<Box<Stmt>>,
        cond: Option<Expr>,
        step: Option<Expr>,
        body: Box<Stmt>,
        line: usize,
    },
    Switch { cond: Expr, cases: Vec<SwitchCase>, line: usize },
    Return { value: Option<Expr>, line: usize },
    ExprStmt(Expr),
    Break(usize),
    Continue(usize),
    Asm { body: String, line: usize },
}

#[derive(Clone, Debug, PartialEq)]
pub struct SwitchCase {
    pub value: Option<i64>, // None = default
    pub body: Vec<Stmt>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Function {
    pub name: String,
    pub params: Vec<Param>,
    pub return_type: TypeInfo,
    pub body: Vec<Stmt>,
    pub line: usize,
}

#[derive(Clone, Debug, PartialEq)]
pub struct GlobalVar {
    pub name: String,
    pub type_info: TypeInfo,
    pub init: Option<Expr>,
    pub line: usize,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Program {
    pub structs: Vec<StructDef>,
    pub globals: Vec<GlobalVar>,
    pub functions: Vec<Function>,
}
