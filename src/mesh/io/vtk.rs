use crate::{
    Error, Idx, Result, Tag,
    mesh::{Elem, Mesh, Point},
    metric::Metric,
};
use log::{debug, info, warn};
use vtkio::{
    IOBuffer, Vtk,
    model::{
        Attribute, Attributes, ByteOrder, CellType, Cells, DataArrayBase, DataSet, ElementType,
        UnstructuredGridPiece, Version, VertexNumbers,
    },
};

const fn cell_type(n_verts: Idx) -> CellType {
    match n_verts {
        4 => CellType::Tetra,
        3 => CellType::Triangle,
        2 => CellType::Line,
        _ => CellType::Vertex,
    }
}

fn data_array(name: &str, num_comp: usize, data: IOBuffer) -> Attribute {
    Attribute::DataArray(DataArrayBase {
        name: name.to_string(),
        elem: if num_comp == 1 {
            ElementType::Scalars {
                num_comp: 1,
                lookup_table: None,
            }
        } else {
            ElementType::Generic(num_comp as u32)
        },
        data,
    })
}

fn find_array(attrs: Vec<Attribute>, name: &str) -> Option<IOBuffer> {
    attrs.into_iter().find_map(|a| match a {
        Attribute::DataArray(a) if a.name == name => Some(a.data),
        _ => None,
    })
}

/// Get the dimension of the elements in a .vtu file: 3 if it contains tetrahedra, 2 if
/// it contains triangles
pub fn vtk_element_dim(file_name: &str) -> Result<usize> {
    let vtk = Vtk::import(file_name)?;
    let DataSet::UnstructuredGrid { pieces, .. } = vtk.data else {
        return Err(Error::from("Only unstructured grids are supported"));
    };
    let Some(piece) = pieces.into_iter().next() else {
        return Err(Error::from("Empty vtk file"));
    };
    let piece = piece.into_loaded_piece_data(None)?;
    let types = &piece.cells.types;
    if types.iter().any(|t| matches!(t, CellType::Tetra)) {
        Ok(3)
    } else if types.iter().any(|t| matches!(t, CellType::Triangle)) {
        Ok(2)
    } else {
        Err(Error::from(&format!("{file_name} contains no triangle or tetrahedron")))
    }
}

impl<const D: usize, E: Elem, M: Metric<D>> Mesh<D, E, M> {
    /// Write the mesh to a .vtu file, with the elements followed by the tagged faces.
    /// The metric is written as point data ("metric") and the element and face
    /// tags as cell data ("tag")
    pub fn write_vtk(&self, file_name: &str) -> Result<()> {
        info!("Write {file_name}");

        let mut new_idx = vec![0; self.n_vert_slots()];
        for (k, i) in self.vert_ids().enumerate() {
            new_idx[i as usize] = k as u64;
        }

        let n_elems = self.n_elems();
        let n_faces = self.n_tagged_faces();
        let nv = E::N_VERTS as u64;
        let nf = <E::Face as Elem>::N_VERTS as u64;

        let mut connectivity = Vec::with_capacity(n_elems * nv as usize + n_faces * nf as usize);
        let mut offsets = Vec::with_capacity(n_elems + n_faces);
        let mut types = Vec::with_capacity(n_elems + n_faces);
        let mut tags = Vec::with_capacity(n_elems + n_faces);
        let mut offset = 0;
        for (e, t) in self.elems().zip(self.etags()) {
            connectivity.extend(e.iter().map(|&i| new_idx[i as usize]));
            offset += nv;
            offsets.push(offset);
            types.push(cell_type(E::N_VERTS));
            tags.push(i64::from(t));
        }
        let mut faces = self.faces().collect::<Vec<_>>();
        faces.sort_by_key(|(f, _)| f.iter().copied().collect::<Vec<_>>());
        for (f, t) in faces {
            connectivity.extend(f.iter().map(|&i| new_idx[i as usize]));
            offset += nf;
            offsets.push(offset);
            types.push(cell_type(<E::Face as Elem>::N_VERTS));
            tags.push(i64::from(t));
        }

        let mut coords = Vec::with_capacity(3 * self.n_verts());
        for p in self.verts() {
            coords.extend(p.iter().copied());
            coords.resize(coords.len() + 3 - D, 0.0);
        }
        let metric = self
            .vert_ids()
            .filter_map(|i| self.get_metric(i))
            .flatten()
            .collect::<Vec<_>>();

        let vtk = Vtk {
            version: Version { major: 1, minor: 0 },
            title: String::new(),
            byte_order: ByteOrder::LittleEndian,
            file_path: None,
            data: DataSet::inline(UnstructuredGridPiece {
                points: IOBuffer::F64(coords),
                cells: Cells {
                    cell_verts: VertexNumbers::XML {
                        connectivity,
                        offsets,
                    },
                    types,
                },
                data: Attributes {
                    point: vec![data_array("metric", M::N, IOBuffer::F64(metric))],
                    cell: vec![data_array("tag", 1, IOBuffer::I64(tags))],
                },
            }),
        };

        vtk.export(file_name)?;

        Ok(())
    }

    /// Read a mesh from a .vtu file. Cells with `E::N_VERTS` vertices are the elements,
    /// cells with `E::Face::N_VERTS` vertices are tagged faces; the other cells are
    /// ignored. If a "metric" point data is present, it is used as the mesh metric
    pub fn from_vtk(file_name: &str) -> Result<Self> {
        info!("Read {file_name}");

        let vtk = Vtk::import(file_name)?;
        let DataSet::UnstructuredGrid { pieces, .. } = vtk.data else {
            return Err(Error::from("Only unstructured grids are supported"));
        };
        let Some(piece) = pieces.into_iter().next() else {
            return Err(Error::from("Empty vtk file"));
        };
        let piece = piece.into_loaded_piece_data(None)?;

        let Some(points) = piece.points.cast_into::<f64>() else {
            return Err(Error::from("Invalid point coordinates"));
        };
        let coords = points
            .chunks(3)
            .map(|p| Point::<D>::from_fn(|i, _| p[i]))
            .collect::<Vec<_>>();
        if points.chunks(3).any(|p| p[D..].iter().any(|&x| x.abs() > 1e-12)) {
            warn!("Non-zero coordinates ignored in {D}D");
        }

        let (connectivity, offsets) = piece.cells.cell_verts.into_xml();
        let n_cells = offsets.len();
        let tags = match find_array(piece.data.cell, "tag").and_then(IOBuffer::cast_into::<i64>)
        {
            Some(tags) if tags.len() == n_cells => tags,
            _ => {
                warn!("No valid cell tags, using 1");
                vec![1; n_cells]
            }
        };

        let mut elems = Vec::new();
        let mut etags = Vec::new();
        let mut faces = Vec::new();
        let mut ftags = Vec::new();
        let mut start = 0;
        for (&end, &tag) in offsets.iter().zip(tags.iter()) {
            let ids = connectivity[start as usize..end as usize]
                .iter()
                .map(|&i| i as Idx)
                .collect::<Vec<_>>();
            start = end;
            let tag = Tag::try_from(tag).map_err(|_| Error::from(&format!("Invalid tag {tag}")))?;
            if ids.len() == E::N_VERTS as usize {
                elems.push(E::from_slice(&ids));
                etags.push(tag);
            } else if ids.len() == <E::Face as Elem>::N_VERTS as usize {
                faces.push(E::Face::from_slice(&ids));
                ftags.push(tag);
            }
        }
        debug!(
            "{} vertices, {} elements, {} faces",
            coords.len(),
            elems.len(),
            faces.len()
        );

        let mut mesh = Self::new(coords, elems, etags, faces, ftags)?;

        if let Some(metric) = find_array(piece.data.point, "metric")
            .and_then(IOBuffer::cast_into::<f64>)
            .filter(|m| m.len() == M::N * mesh.n_vert_slots())
        {
            let metric = metric.chunks(M::N).map(M::from_slice).collect::<Vec<_>>();
            mesh.set_metrics(&metric)?;
        }

        Ok(mesh)
    }
}
