//! Expression compilation.
//!
//! Every expression leaves its value in a register, recorded by id so that
//! continuation sites can save and restore pending operands. Unit values are
//! the `i32` zero.

use crate::diagnostics::Diagnostic;
use crate::effects::EffectRef;
use crate::hir::{BinOp, Expr, ExprKind, Stmt, Type};
use crate::target::{BinaryOp, Instr, Reg, ValType};

use super::dispatch::binary;
use super::types::{emit_literal, to_uniform};
use super::{OwnerCodegen, SupportSymbol};

impl<'c, 'a> OwnerCodegen<'c, 'a> {
    /// Compile `e` and return the register holding its value.
    pub(super) fn expr(&mut self, e: &'c Expr) -> Result<Reg, Diagnostic> {
        let reg = self.expr_kind(e)?;
        self.exprs.insert(e.id, reg);
        Ok(reg)
    }

    fn expr_kind(&mut self, e: &'c Expr) -> Result<Reg, Diagnostic> {
        match &e.kind {
            ExprKind::Literal(lit) => {
                let ty = self.concrete(&e.ty);
                Ok(emit_literal(&mut self.fb, *lit, &ty))
            }
            ExprKind::Local(local) => self.read_local(*local),
            ExprKind::Binary { op, lhs, rhs } => self.binary_expr(*op, lhs, rhs),
            ExprKind::If {
                cond,
                then_branch,
                else_branch,
            } => self.if_expr(e, cond, then_branch, else_branch.as_deref()),
            ExprKind::While { cond, body } => {
                let head = self.fb.new_label();
                let end = self.fb.new_label();
                self.fb.bind(head);
                let c = self.expr(cond)?;
                self.fb.branch_if_not(c, end);
                self.expr(body)?;
                self.fb.jump(head);
                self.fb.bind(end);
                Ok(self.fb.i32_const(0))
            }
            ExprKind::Block { stmts, tail } => {
                for stmt in stmts {
                    match stmt {
                        Stmt::Let { local, init } => {
                            let src = self.expr(init)?;
                            self.bind_local(*local, src)?;
                        }
                        Stmt::Expr(expr) => {
                            self.expr(expr)?;
                        }
                    }
                }
                match tail {
                    Some(tail) => self.expr(tail),
                    None => Ok(self.fb.i32_const(0)),
                }
            }
            ExprKind::Assign { local, value } => {
                let src = self.expr(value)?;
                self.assign_local(*local, src)?;
                Ok(self.fb.i32_const(0))
            }
            ExprKind::Call {
                callee,
                type_args,
                args,
            } => {
                let mut values = Vec::with_capacity(args.len() + 1);
                for arg in args {
                    values.push(self.expr(arg)?);
                }
                let type_args: Vec<Type> = type_args.iter().map(|t| self.concrete(t)).collect();
                let func = self.cx.instance(*callee, type_args);
                let ty = self.concrete(&e.ty);
                match self.open_site(e)? {
                    Some(slot) => {
                        values.insert(0, self.hs);
                        let r = self.fb.call(func, values, ValType::AnyRef);
                        self.fb.emit(Instr::Move {
                            dst: self.slots[slot].result,
                            src: r,
                        });
                        self.close_site(slot, &ty)
                    }
                    None => {
                        let val = self.cx.val_type(&ty)?;
                        Ok(self.fb.call(func, values, val))
                    }
                }
            }
            ExprKind::Perform {
                effect,
                type_args,
                op,
                args,
            } => {
                let effect = EffectRef::new(*effect, type_args.iter().map(|t| self.concrete(t)).collect());
                self.perform(e, &effect, *op, args)
            }
            ExprKind::Handle { handler, .. } => self.handle(e, handler),
            ExprKind::Resume { call, cont, value } => self.continuation_call(e, *call, *cont, value),
            ExprKind::StructLit { fields, .. } => {
                let ty = self.concrete(&e.ty);
                let idx = self.cx.struct_type(&ty)?;
                let mut values = Vec::with_capacity(fields.len());
                for field in fields {
                    values.push(self.expr(field)?);
                }
                Ok(self.fb.new_struct(idx, values))
            }
            ExprKind::Field { base, index } => {
                let obj = self.expr(base)?;
                let base_ty = self.concrete(&base.ty);
                let idx = self.cx.struct_type(&base_ty)?;
                let field_ty = self.concrete(&e.ty);
                let val = self.cx.val_type(&field_ty)?;
                let typed = self.fb.cast(obj, idx);
                Ok(self.fb.get(typed, idx, *index, val))
            }
            ExprKind::Return(value) => {
                let v = self.expr(value)?;
                let ret = self.concrete(&self.inst.f.ret);
                if self.owner.owner.is_lambda() {
                    // Leaves the handled body or clause as a returned result.
                    let (word, reference) = to_uniform(&mut self.fb, v, &ret);
                    let frame = self.return_frame()?;
                    let make_returned = self.cx.support(SupportSymbol::MakeReturned);
                    let out = self.fb.call(make_returned, vec![word, reference, frame], ValType::AnyRef);
                    self.fb.ret(out);
                } else {
                    self.exit(v, &ret)?;
                }
                Ok(self.fb.i32_const(0))
            }
        }
    }

    fn binary_expr(&mut self, op: BinOp, lhs: &'c Expr, rhs: &'c Expr) -> Result<Reg, Diagnostic> {
        if op.is_short_circuit() {
            let out = self.fb.reg(ValType::I32);
            let end = self.fb.new_label();
            let l = self.expr(lhs)?;
            self.fb.emit(Instr::Move { dst: out, src: l });
            if op == BinOp::And {
                self.fb.branch_if_not(out, end);
            } else {
                self.fb.branch_if(out, end);
            }
            let r = self.expr(rhs)?;
            self.fb.emit(Instr::Move { dst: out, src: r });
            self.fb.bind(end);
            return Ok(out);
        }
        let l = self.expr(lhs)?;
        let r = self.expr(rhs)?;
        let operand = self.concrete(&lhs.ty);
        let machine_op = select_op(op, &operand);
        let ty = if machine_op.is_i64() && !machine_op.is_comparison() {
            ValType::I64
        } else {
            ValType::I32
        };
        Ok(binary(&mut self.fb, machine_op, l, r, ty))
    }

    fn if_expr(
        &mut self,
        e: &'c Expr,
        cond: &'c Expr,
        then_branch: &'c Expr,
        else_branch: Option<&'c Expr>,
    ) -> Result<Reg, Diagnostic> {
        let ty = self.concrete(&e.ty);
        let out = self.fb.reg(self.cx.val_type(&ty)?);
        let otherwise = self.fb.new_label();
        let end = self.fb.new_label();
        let c = self.expr(cond)?;
        self.fb.branch_if_not(c, otherwise);
        let t = self.expr(then_branch)?;
        if !ty.is_unit() {
            self.fb.emit(Instr::Move { dst: out, src: t });
        }
        self.fb.jump(end);
        self.fb.bind(otherwise);
        if let Some(else_branch) = else_branch {
            let f = self.expr(else_branch)?;
            if !ty.is_unit() {
                self.fb.emit(Instr::Move { dst: out, src: f });
            }
        }
        self.fb.bind(end);
        if ty.is_unit() {
            self.fb.emit(Instr::I32Const { dst: out, value: 0 });
        }
        Ok(out)
    }
}

/// Machine operator for `op` on operands of type `operand`.
fn select_op(op: BinOp, operand: &Type) -> BinaryOp {
    match operand {
        Type::I64 => match op {
            BinOp::Add => BinaryOp::I64Add,
            BinOp::Sub => BinaryOp::I64Sub,
            BinOp::Mul => BinaryOp::I64Mul,
            BinOp::Eq => BinaryOp::I64Eq,
            BinOp::Ne => BinaryOp::I64Ne,
            BinOp::Lt => BinaryOp::I64LtS,
            BinOp::Le => BinaryOp::I64LeS,
            BinOp::Gt => BinaryOp::I64GtS,
            BinOp::Ge => BinaryOp::I64GeS,
            BinOp::And | BinOp::Or => BinaryOp::I32Ne,
        },
        Type::U32 => match op {
            BinOp::Lt => BinaryOp::I32LtU,
            BinOp::Le => BinaryOp::I32LeU,
            BinOp::Gt => BinaryOp::I32GtU,
            BinOp::Ge => BinaryOp::I32GeU,
            other => select_op(other, &Type::I32),
        },
        _ => match op {
            BinOp::Add => BinaryOp::I32Add,
            BinOp::Sub => BinaryOp::I32Sub,
            BinOp::Mul => BinaryOp::I32Mul,
            BinOp::Eq => BinaryOp::I32Eq,
            BinOp::Ne => BinaryOp::I32Ne,
            BinOp::Lt => BinaryOp::I32LtS,
            BinOp::Le => BinaryOp::I32LeS,
            BinOp::Gt => BinaryOp::I32GtS,
            BinOp::Ge => BinaryOp::I32GeS,
            BinOp::And | BinOp::Or => BinaryOp::I32Ne,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unsigned_comparisons() {
        assert_eq!(select_op(BinOp::Lt, &Type::U32), BinaryOp::I32LtU);
        assert_eq!(select_op(BinOp::Add, &Type::U32), BinaryOp::I32Add);
        assert_eq!(select_op(BinOp::Lt, &Type::I32), BinaryOp::I32LtS);
        assert_eq!(select_op(BinOp::Mul, &Type::I64), BinaryOp::I64Mul);
    }
}
