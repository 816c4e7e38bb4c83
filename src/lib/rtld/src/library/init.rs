use super::{Module, Table};

impl Module {
    fn function_array(&self, table: Option<Table>) -> Vec<usize> {
        let Some(table) = table else {
            return vec![];
        };
        self.mem(table.addr, table.size)
            .chunks_exact(core::mem::size_of::<usize>())
            .filter_map(|w| w.try_into().ok().map(usize::from_ne_bytes))
            // 0 and -1 are both used as "nothing here" by various toolchains.
            .filter(|&f| f != 0 && f != usize::MAX)
            .collect()
    }

    /// Initialization functions in the order they run: `DT_INIT`, then `DT_INIT_ARRAY`.
    pub(crate) fn initializers(&self) -> Vec<usize> {
        let mut funcs: Vec<_> = self
            .dynamic
            .init
            .map(|init| self.laddr(init))
            .into_iter()
            .collect();
        funcs.extend(self.function_array(self.dynamic.init_array));
        funcs
    }

    /// Finalization functions in the order they run: `DT_FINI_ARRAY` backwards, then `DT_FINI`.
    pub(crate) fn finalizers(&self) -> Vec<usize> {
        let mut funcs = self.function_array(self.dynamic.fini_array);
        funcs.reverse();
        funcs.extend(self.dynamic.fini.map(|fini| self.laddr(fini)));
        funcs
    }

    /// `DT_PREINIT_ARRAY`, which only counts in the main program.
    pub(crate) fn preinitializers(&self) -> Vec<usize> {
        if !self.is_main() {
            return vec![];
        }
        self.function_array(self.dynamic.preinit_array)
    }
}
