//! Column cache and temporary registers
//!
//! The column cache remembers which register currently holds a
//! (cursor, column) value so that a column read twice in one row is loaded
//! once. Entries are scoped by push/pop levels: anything stored inside a
//! conditionally executed branch is forgotten when the branch ends.
//!
//! A temporary register released while the cache still points at it stays
//! reserved until the cache line is dropped.

use crate::executor::parse::{ColCacheEntry, Parse, MAX_TEMP_REGS};
use crate::types::{Cursor, Reg};
use crate::vdbe::ops::Opcode;

impl Parse {
    // ------------------------------------------------------------------
    // Temporary registers
    // ------------------------------------------------------------------

    /// Allocate one register for an intermediate result
    pub fn get_temp_reg(&mut self) -> Reg {
        match self.temp_regs.pop() {
            Some(reg) => reg,
            None => self.alloc_reg(),
        }
    }

    /// Return a register to the pool. Deferred while the column cache
    /// still references it.
    pub fn release_temp_reg(&mut self, reg: Reg) {
        if reg == 0 || self.temp_regs.len() >= MAX_TEMP_REGS {
            return;
        }
        let mut cached = false;
        for entry in self.col_cache.iter_mut().filter(|e| e.reg == reg) {
            entry.temp_reg = true;
            cached = true;
        }
        if !cached {
            self.temp_regs.push(reg);
        }
    }

    /// Allocate `n` consecutive registers
    pub fn get_temp_range(&mut self, n: i32) -> Reg {
        if n == 1 {
            return self.get_temp_reg();
        }
        if n <= self.n_range_reg {
            let base = self.range_reg;
            self.range_reg += n;
            self.n_range_reg -= n;
            base
        } else {
            self.alloc_regs(n)
        }
    }

    pub fn release_temp_range(&mut self, reg: Reg, n: i32) {
        if n == 1 {
            self.release_temp_reg(reg);
            return;
        }
        self.cache_remove(reg, n);
        if n > self.n_range_reg {
            self.n_range_reg = n;
            self.range_reg = reg;
        }
    }

    /// Make every temporary register unavailable for reuse
    pub fn clear_temp_reg_cache(&mut self) {
        self.temp_regs.clear();
        self.n_range_reg = 0;
    }

    // ------------------------------------------------------------------
    // Column cache
    // ------------------------------------------------------------------

    fn cache_entry_clear(&mut self, i: usize) {
        let entry = self.col_cache.swap_remove(i);
        if entry.temp_reg && self.temp_regs.len() < MAX_TEMP_REGS {
            self.temp_regs.push(entry.reg);
        }
    }

    /// Record that column `column` of `cursor` is held in `reg`. When the
    /// cache is full the least recently used line is replaced.
    pub fn cache_store(&mut self, cursor: Cursor, column: usize, reg: Reg) {
        let capacity = self.config.column_cache_size;
        if capacity == 0 {
            return;
        }
        let entry = ColCacheEntry {
            level: self.cache_level,
            cursor,
            column,
            reg,
            temp_reg: false,
            lru: self.cache_cnt,
        };
        self.cache_cnt += 1;
        if self.col_cache.len() >= capacity {
            if let Some(idx) = self
                .col_cache
                .iter()
                .enumerate()
                .min_by_key(|(_, e)| e.lru)
                .map(|(i, _)| i)
            {
                self.col_cache[idx] = entry;
            }
        } else {
            self.col_cache.push(entry);
        }
    }

    /// Forget every line whose register lies in `reg..reg+n`
    pub fn cache_remove(&mut self, reg: Reg, n: i32) {
        let mut i = 0;
        while i < self.col_cache.len() {
            let r = self.col_cache[i].reg;
            if r >= reg && r < reg + n {
                self.cache_entry_clear(i);
            } else {
                i += 1;
            }
        }
    }

    /// Open a cache scope
    pub fn cache_push(&mut self) {
        self.cache_level += 1;
    }

    /// Close the innermost cache scope, dropping lines stored inside it
    pub fn cache_pop(&mut self) {
        debug_assert!(self.cache_level >= 1);
        self.cache_level -= 1;
        let mut i = 0;
        while i < self.col_cache.len() {
            if self.col_cache[i].level > self.cache_level {
                self.cache_entry_clear(i);
            } else {
                i += 1;
            }
        }
    }

    /// Drop every line
    pub fn cache_clear(&mut self) {
        let lines = std::mem::take(&mut self.col_cache);
        for entry in lines {
            if entry.temp_reg && self.temp_regs.len() < MAX_TEMP_REGS {
                self.temp_regs.push(entry.reg);
            }
        }
    }

    /// The values of `start..start+count` changed type; cached copies are
    /// stale.
    pub fn cache_affinity_change(&mut self, start: Reg, count: i32) {
        self.cache_remove(start, count);
    }

    fn cache_pin_register(&mut self, reg: Reg) {
        for entry in self.col_cache.iter_mut().filter(|e| e.reg == reg) {
            entry.temp_reg = false;
        }
    }

    /// Register holding column `column` of `cursor`, loading it into `reg`
    /// unless the cache already has it. A non-zero `p5` marks a partial
    /// read (length/typeof) that must not be cached.
    pub fn expr_code_get_column(&mut self, cursor: Cursor, column: usize, reg: Reg, p5: u16) -> Reg {
        let stamp = self.cache_cnt;
        let hit = self
            .col_cache
            .iter_mut()
            .find(|e| e.cursor == cursor && e.column == column)
            .map(|e| {
                e.lru = stamp;
                e.reg
            });
        if let Some(cached) = hit {
            self.cache_cnt += 1;
            self.cache_pin_register(cached);
            return cached;
        }
        self.vdbe.add_op(Opcode::Column, cursor, column as i32, reg);
        if p5 != 0 {
            self.vdbe.change_p5(p5);
        } else {
            self.cache_store(cursor, column, reg);
        }
        reg
    }

    /// Load a column into exactly `reg`
    pub fn expr_code_get_column_to_reg(&mut self, cursor: Cursor, column: usize, reg: Reg) {
        let r = self.expr_code_get_column(cursor, column, reg, 0);
        if r != reg {
            self.vdbe.add_op2(Opcode::SCopy, r, reg);
        }
    }

    /// Move `n` registers from `from` to `to`
    pub fn expr_code_move(&mut self, from: Reg, to: Reg, n: i32) {
        self.vdbe.add_op(Opcode::Move, from, to, n);
        self.cache_remove(from, n);
    }

    /// Number of live cache lines
    pub fn cache_len(&self) -> usize {
        self.col_cache.len()
    }
}

#[cfg(test)]
mod tests {
    use crate::config::CompileConfig;
    use crate::executor::parse::Parse;
    use crate::vdbe::ops::Opcode;

    #[test]
    fn test_get_column_uses_cache() {
        let mut parse = Parse::default();
        let r = parse.alloc_reg();
        assert_eq!(parse.expr_code_get_column(0, 2, r, 0), r);
        let other = parse.alloc_reg();
        assert_eq!(parse.expr_code_get_column(0, 2, other, 0), r);
        let columns = parse
            .vdbe
            .ops()
            .iter()
            .filter(|op| op.opcode == Opcode::Column)
            .count();
        assert_eq!(columns, 1);
    }

    #[test]
    fn test_partial_read_is_not_cached() {
        let mut parse = Parse::default();
        let r = parse.alloc_reg();
        parse.expr_code_get_column(0, 1, r, 0x80);
        assert_eq!(parse.cache_len(), 0);
        assert_eq!(parse.vdbe.last_op().unwrap().p5, 0x80);
    }

    #[test]
    fn test_push_pop_scopes_entries() {
        let mut parse = Parse::default();
        parse.cache_store(0, 0, 1);
        parse.cache_push();
        parse.cache_store(0, 1, 2);
        assert_eq!(parse.cache_len(), 2);
        parse.cache_pop();
        assert_eq!(parse.cache_len(), 1);
        assert_eq!(parse.col_cache[0].column, 0);
    }

    #[test]
    fn test_lru_eviction() {
        let config = CompileConfig {
            column_cache_size: 2,
            ..CompileConfig::default()
        };
        let mut parse = Parse::new(config);
        parse.cache_store(0, 0, 1);
        parse.cache_store(0, 1, 2);
        // touch column 0 so column 1 becomes least recently used
        parse.expr_code_get_column(0, 0, 9, 0);
        parse.cache_store(0, 2, 3);
        assert_eq!(parse.cache_len(), 2);
        assert!(parse.col_cache.iter().any(|e| e.column == 0));
        assert!(!parse.col_cache.iter().any(|e| e.column == 1));
    }

    #[test]
    fn test_release_is_deferred_while_cached() {
        let mut parse = Parse::default();
        let r = parse.get_temp_reg();
        parse.cache_store(1, 0, r);
        parse.release_temp_reg(r);
        // still reserved
        assert_ne!(parse.get_temp_reg(), r);
        parse.cache_remove(r, 1);
        assert_eq!(parse.get_temp_reg(), r);
    }

    #[test]
    fn test_temp_ranges() {
        let mut parse = Parse::default();
        let base = parse.get_temp_range(3);
        parse.release_temp_range(base, 3);
        assert_eq!(parse.get_temp_range(2), base);
        // one register left in the range, but single registers come from
        // the temp pool
        let single = parse.get_temp_range(1);
        assert_eq!(single, parse.n_mem);
        parse.clear_temp_reg_cache();
        let fresh = parse.get_temp_range(3);
        assert!(fresh > base);
    }
}
