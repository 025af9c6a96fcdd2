use crate::record::{default_cell_type_adaptor, CellTypeAdaptor};

/// Construction options for a [`Notebook`](crate::Notebook).
#[derive(Debug, Clone, Copy)]
pub struct NotebookOptions {
    /// Give every cell its own undo history instead of one for the whole notebook.
    pub disable_document_wide_undo_redo: bool,
    /// Resolves stored `cell_type` strings to cell variants.
    pub cell_type_adaptor: CellTypeAdaptor,
}

impl Default for NotebookOptions {
    fn default() -> Self {
        Self {
            disable_document_wide_undo_redo: false,
            cell_type_adaptor: default_cell_type_adaptor,
        }
    }
}

impl NotebookOptions {
    pub fn per_cell_undo(mut self) -> Self {
        self.disable_document_wide_undo_redo = true;
        self
    }

    pub fn with_cell_type_adaptor(mut self, adaptor: CellTypeAdaptor) -> Self {
        self.cell_type_adaptor = adaptor;
        self
    }
}
