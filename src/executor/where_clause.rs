//! WHERE clause terms
//!
//! A [`WhereClause`] is the flat array of terms obtained by splitting a
//! predicate on its top-level AND (or OR, for the sub-clause of a
//! disjunction). The analyzer in `where_expr` fills in the per-term
//! fields; the access-path code in `wherecode` reads them.
//!
//! Terms refer to each other by index: a synthesized term records the
//! index of the term it was derived from in `parent`.

use bitflags::bitflags;

use crate::parser::ast::{BinaryOp, Expr};
use crate::types::{Bitmask, Cursor, BMS};

// ============================================================================
// Operator masks
// ============================================================================

bitflags! {
    /// How a term can constrain an index on its left-hand column
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
    pub struct OperatorMask: u16 {
        const IN = 0x0001;
        const EQ = 0x0002;
        const LT = 0x0004;
        const LE = 0x0008;
        const GT = 0x0010;
        const GE = 0x0020;
        const MATCH = 0x0040;
        const ISNULL = 0x0100;
        /// Two or more OR-connected terms
        const OR = 0x0200;
        /// Two or more AND-connected terms
        const AND = 0x0400;
        /// Of the form A==B, both columns
        const EQUIV = 0x0800;
        /// Term does not restrict the search space
        const NOOP = 0x1000;
    }
}

impl OperatorMask {
    /// Every operator bit
    pub const ALL: OperatorMask = OperatorMask::from_bits_truncate(0x1fff);
    /// Mask of all non-compound operators
    pub const SINGLE: OperatorMask = OperatorMask::from_bits_truncate(0x01ff);

    /// Operator bit for an indexable comparison
    pub fn from_binary(op: BinaryOp) -> Option<OperatorMask> {
        let mask = match op {
            BinaryOp::Eq => OperatorMask::EQ,
            BinaryOp::Lt => OperatorMask::LT,
            BinaryOp::Le => OperatorMask::LE,
            BinaryOp::Gt => OperatorMask::GT,
            BinaryOp::Ge => OperatorMask::GE,
            _ => return None,
        };
        Some(mask)
    }

    /// Comparison operator denoted by a single comparison bit
    pub fn to_binary(self) -> Option<BinaryOp> {
        let op = match self {
            m if m == OperatorMask::EQ => BinaryOp::Eq,
            m if m == OperatorMask::LT => BinaryOp::Lt,
            m if m == OperatorMask::LE => BinaryOp::Le,
            m if m == OperatorMask::GT => BinaryOp::Gt,
            m if m == OperatorMask::GE => BinaryOp::Ge,
            _ => return None,
        };
        Some(op)
    }
}

// ============================================================================
// Term flags
// ============================================================================

bitflags! {
    /// Bookkeeping bits of a [`WhereTerm`]
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
    pub struct WhereTermFlags: u16 {
        /// Expression was synthesized by the analyzer
        const DYNAMIC = 0x0001;
        /// Added by the optimizer. Do not code
        const VIRTUAL = 0x0002;
        /// This term is already coded
        const CODED = 0x0004;
        /// Has a child
        const COPIED = 0x0008;
        /// `or_info` is valid
        const OR_INFO = 0x0010;
        /// `and_info` is valid
        const AND_INFO = 0x0020;
        /// Used during OR-clause processing
        const OR_OK = 0x0040;
        /// Manufactured `x > NULL` term
        const VNULL = 0x0080;
        /// Virtual range term generated from a LIKE
        const LIKE_OPT = 0x0100;
        /// Conditionally this LIKE operator term
        const LIKE_COND = 0x0200;
        /// Classification already done
        const ANALYZED = 0x0400;
    }
}

// ============================================================================
// Terms
// ============================================================================

/// Sub-clause of an OR term
#[derive(Debug, Clone, PartialEq)]
pub struct WhereOrInfo {
    /// The disjuncts
    pub wc: WhereClause,
    /// Cursors that can index every disjunct
    pub indexable: Bitmask,
}

/// Sub-clause of an AND-connected disjunct
#[derive(Debug, Clone, PartialEq)]
pub struct WhereAndInfo {
    pub wc: WhereClause,
}

/// One term of a WHERE clause
#[derive(Debug, Clone, PartialEq)]
pub struct WhereTerm {
    /// The term, with top-level COLLATE wrappers removed
    pub expr: Expr,
    pub flags: WhereTermFlags,
    /// Indexable operators, empty if the term cannot drive an index
    pub operator: OperatorMask,
    /// Term this one was derived from
    pub parent: Option<usize>,
    /// Number of terms derived from this one
    pub n_child: u8,
    /// Cursor of the left-hand column, -1 if not indexable
    pub left_cursor: Cursor,
    /// Column on the left-hand side
    pub left_column: usize,
    /// For a vector IN, 1-based element of the left vector this term
    /// stands for; 0 for the whole expression
    pub field: usize,
    /// Cursors used by the right-hand side
    pub prereq_right: Bitmask,
    /// Cursors used anywhere in the term
    pub prereq_all: Bitmask,
    pub or_info: Option<Box<WhereOrInfo>>,
    pub and_info: Option<Box<WhereAndInfo>>,
}

impl WhereTerm {
    pub fn new(expr: Expr, flags: WhereTermFlags) -> Self {
        WhereTerm {
            expr,
            flags,
            operator: OperatorMask::empty(),
            parent: None,
            n_child: 0,
            left_cursor: -1,
            left_column: 0,
            field: 0,
            prereq_right: 0,
            prereq_all: 0,
            or_info: None,
            and_info: None,
        }
    }

    pub fn has_flag(&self, flag: WhereTermFlags) -> bool {
        self.flags.intersects(flag)
    }

    /// Term is coded as part of the per-row filter
    pub fn is_virtual(&self) -> bool {
        self.flags.contains(WhereTermFlags::VIRTUAL)
    }

    /// Term can drive an index on (`left_cursor`, `left_column`)
    pub fn is_indexable(&self) -> bool {
        self.left_cursor >= 0 && self.operator.intersects(OperatorMask::SINGLE)
    }
}

/// Flat list of AND- or OR-connected terms
#[derive(Debug, Clone, PartialEq)]
pub struct WhereClause {
    /// Connective splitting the terms
    pub op: BinaryOp,
    pub terms: Vec<WhereTerm>,
}

impl WhereClause {
    pub fn new(op: BinaryOp) -> Self {
        WhereClause {
            op,
            terms: Vec::new(),
        }
    }

    /// Append a term, returning its index
    pub fn insert(&mut self, expr: Expr, flags: WhereTermFlags) -> usize {
        let expr = expr.skip_collate().clone();
        self.terms.push(WhereTerm::new(expr, flags));
        self.terms.len() - 1
    }

    /// Record that `child` was derived from `parent`
    pub fn mark_child(&mut self, child: usize, parent: usize) {
        self.terms[child].parent = Some(parent);
        self.terms[parent].n_child = self.terms[parent].n_child.saturating_add(1);
    }

    pub fn len(&self) -> usize {
        self.terms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }

    pub fn term(&self, idx: usize) -> &WhereTerm {
        &self.terms[idx]
    }

    /// Terms that must be evaluated per row
    pub fn coded_terms(&self) -> impl Iterator<Item = (usize, &WhereTerm)> {
        self.terms
            .iter()
            .enumerate()
            .filter(|(_, t)| !t.has_flag(WhereTermFlags::VIRTUAL | WhereTermFlags::CODED))
    }

    /// First term constraining column `column` of `cursor` with one of the
    /// operators in `ops`, whose right-hand side only depends on cursors
    /// outside `not_ready`. Equality terms are preferred.
    pub fn find_term(
        &self,
        cursor: Cursor,
        column: usize,
        not_ready: Bitmask,
        ops: OperatorMask,
    ) -> Option<usize> {
        let mut found = None;
        for (i, term) in self.terms.iter().enumerate() {
            if term.left_cursor != cursor
                || term.left_column != column
                || term.field != 0
                || (term.prereq_right & not_ready) != 0
                || !term.operator.intersects(ops)
            {
                continue;
            }
            if term.operator.contains(OperatorMask::EQ) {
                return Some(i);
            }
            if found.is_none() {
                found = Some(i);
            }
        }
        found
    }

    /// Drop every term and the sub-clauses they own
    pub fn clear(&mut self) {
        self.terms.clear();
    }
}

// ============================================================================
// Cursor masks
// ============================================================================

/// Maps cursor numbers onto bit positions
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MaskSet {
    cursors: Vec<Cursor>,
}

impl MaskSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Assign the next bit to `cursor`. Cursors beyond the mask width
    /// share no bit and are never indexable.
    pub fn create_mask(&mut self, cursor: Cursor) {
        if self.cursors.len() < BMS && !self.cursors.contains(&cursor) {
            self.cursors.push(cursor);
        }
    }

    /// Bit of `cursor`, 0 if it has none
    pub fn get_mask(&self, cursor: Cursor) -> Bitmask {
        self.cursors
            .iter()
            .position(|&c| c == cursor)
            .map(|i| 1u64 << i)
            .unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.cursors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cursors.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operator_mask_round_trip() {
        for op in [BinaryOp::Eq, BinaryOp::Lt, BinaryOp::Le, BinaryOp::Gt, BinaryOp::Ge] {
            let mask = OperatorMask::from_binary(op).unwrap();
            assert_eq!(mask.to_binary(), Some(op));
        }
        assert_eq!(OperatorMask::from_binary(BinaryOp::Ne), None);
        assert_eq!((OperatorMask::LE | OperatorMask::EQ).to_binary(), None);
        assert!(OperatorMask::SINGLE.contains(OperatorMask::ISNULL));
        assert!(!OperatorMask::SINGLE.contains(OperatorMask::OR));
    }

    #[test]
    fn test_insert_strips_collate_and_links_children() {
        let mut wc = WhereClause::new(BinaryOp::And);
        let a = wc.insert(Expr::collate(Expr::int(1), "binary"), WhereTermFlags::empty());
        let b = wc.insert(Expr::int(2), WhereTermFlags::VIRTUAL);
        wc.mark_child(b, a);
        assert_eq!(wc.term(a).expr, Expr::int(1));
        assert_eq!(wc.term(b).parent, Some(a));
        assert_eq!(wc.term(a).n_child, 1);
        assert_eq!(wc.coded_terms().count(), 1);
    }

    #[test]
    fn test_mask_set() {
        let mut masks = MaskSet::new();
        masks.create_mask(7);
        masks.create_mask(3);
        masks.create_mask(7);
        assert_eq!(masks.len(), 2);
        assert_eq!(masks.get_mask(7), 1);
        assert_eq!(masks.get_mask(3), 2);
        assert_eq!(masks.get_mask(9), 0);
    }

    #[test]
    fn test_find_term_prefers_equality() {
        let mut wc = WhereClause::new(BinaryOp::And);
        let lt = wc.insert(Expr::int(1), WhereTermFlags::empty());
        let eq = wc.insert(Expr::int(2), WhereTermFlags::empty());
        for (idx, op) in [(lt, OperatorMask::LT), (eq, OperatorMask::EQ)] {
            let term = &mut wc.terms[idx];
            term.left_cursor = 0;
            term.left_column = 1;
            term.operator = op;
        }
        assert_eq!(wc.find_term(0, 1, 0, OperatorMask::ALL), Some(eq));
        assert_eq!(wc.find_term(0, 1, 0, OperatorMask::LT), Some(lt));
        assert_eq!(wc.find_term(0, 2, 0, OperatorMask::ALL), None);
        wc.terms[eq].prereq_right = 4;
        assert_eq!(wc.find_term(0, 1, 4, OperatorMask::ALL), Some(lt));
    }
}
